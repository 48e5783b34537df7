const BASE_DIR_IN: &str = "tests/snapshots/in";
const BASE_DIR_OUT: &str = "tests/snapshots/out";

// NOTE(eddyb) outputs are (re)written, not compared, so changes to them show
// up in `git diff` (and get reviewed alongside the code that caused them).
#[test]
fn snapshots() {
    let paths = std::fs::read_dir(BASE_DIR_IN).unwrap();
    std::fs::create_dir_all(BASE_DIR_OUT).unwrap();

    for path in paths {
        let path = path.unwrap().path();
        let file_stem = path.file_stem().unwrap().to_str().unwrap();
        let extension = path.extension().unwrap().to_str().unwrap();
        match extension {
            "spvasm" => {}
            // Per-input `Config` overrides, read below.
            "json" => continue,
            _ => panic!("Unsupported file extension: {extension}"),
        }

        let config_path = path.with_extension("json");
        let config = if config_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(config_path).unwrap()).unwrap()
        } else {
            spv_structurize::structurize::Config::DEFAULT
        };

        let text = std::fs::read_to_string(&path).unwrap();
        let module = spv_structurize::Module::lower_from_spvasm(
            std::rc::Rc::new(spv_structurize::Context::new()),
            &text,
            &config,
        )
        .unwrap_or_else(|e| panic!("{}: {e}", path.display()));
        std::fs::write(format!("{BASE_DIR_OUT}/{file_stem}.txt"), module.print()).unwrap();
    }
}
