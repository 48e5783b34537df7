use std::rc::Rc;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = std::env::args().collect::<Vec<_>>();
    let (in_file, config_file) = match &args[..] {
        [_, in_file] => (in_file, None),
        [_, in_file, config_file] => (in_file, Some(config_file)),
        _ => {
            eprintln!("Usage: {} IN.spvasm [CONFIG.json]", args[0]);
            std::process::exit(1);
        }
    };

    let config = match config_file {
        Some(config_file) => {
            let parsed = std::fs::read_to_string(config_file)
                .map_err(|e| e.to_string())
                .and_then(|json| serde_json::from_str(&json).map_err(|e| e.to_string()));
            match parsed {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: failed to load config from `{config_file}`: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => spv_structurize::structurize::Config::DEFAULT,
    };

    let text = match std::fs::read_to_string(in_file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: failed to read `{in_file}`: {e}");
            std::process::exit(1);
        }
    };

    let cx = Rc::new(spv_structurize::Context::new());
    match spv_structurize::Module::lower_from_spvasm(cx, &text, &config) {
        Ok(module) => print!("{}", module.print()),
        Err(e) => {
            if e.is_internal() {
                eprintln!("internal compiler error: {e}");
            } else {
                eprintln!("error: {e}");
            }
            std::process::exit(1);
        }
    }
}
