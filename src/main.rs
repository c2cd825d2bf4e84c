extern crate sample_app;
extern crate env_logger;
#[macro_use] extern crate log;

use std::io::Write;
use std::process;

use log::Level;


/// Every interface, port 8000
const ADDR: &'static str = "0.0.0.0:8000";


fn init_logger() -> Result<(), Box<dyn std::error::Error>> {
    let filters = ::std::env::var("LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(buf, "[{}] - [{}] -> {}",
                record.level(),
                record.module_path().unwrap_or("?"),
                record.args()
                )
            })
        .parse(&filters)
        .try_init()?;
    Ok(())
}


pub fn main() {
    if let Err(e) = init_logger() {
        eprintln!("Error: failed to initialize logger: {}", e);
    }
    if let Err(e) = sample_app::start(ADDR, sample_app::respond) {
        if log_enabled!(Level::Error) {
            error!("Error: {}", e);
        } else {
            eprintln!("Error: {}", e);
        }
        process::exit(1);
    }
}
