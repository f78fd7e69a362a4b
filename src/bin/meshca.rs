use std::sync::Arc;
use meshca::config::Config;
use meshca::server::start::start_meshca_daemon;

#[tokio::main]
async fn main() {
    match Config::create() {
        Ok(config) => {
            if let Err(e) = start_meshca_daemon(Arc::new(config)).await {
                eprintln!("meshca failed to start: {}", e);
                ::std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    }
}
