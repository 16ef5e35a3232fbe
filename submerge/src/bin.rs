use std::path::PathBuf;
use std::process::exit;

fn main() {
    let config_path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => {
            eprintln!("usage: submerge <config.xml>");
            exit(2);
        }
    };

    if let Err(e) = submerge::run(&config_path) {
        eprintln!("submerge: {e}");
        exit(1);
    }
}
