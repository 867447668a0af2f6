use undertow_tc::TcConfig;

fn main() {
    let cfg = match std::env::args().nth(1) {
        Some(path) => {
            let doc = std::fs::read_to_string(&path).expect("config file");
            TcConfig::from_json(&doc).expect("config document")
        }
        None => TcConfig::default(),
    };
    match undertow::demo(cfg) {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
        }
        Err(e) => {
            eprintln!("demo failed: {:?}", e);
            std::process::exit(1);
        }
    }
}
