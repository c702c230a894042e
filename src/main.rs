use pylon_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    // logging is configured from the file, so load errors go to stderr
    let config = match ConfigWrapper::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config {}: {:?}", options.config_file, err);
            std::process::exit(255);
        }
    };

    pylon_bridge::init_logging(&config.loglevel());

    if let Err(err) = pylon_bridge::run(config, options.runtime).await {
        error!("{:?}", err);
        std::process::exit(1);
    }
}
