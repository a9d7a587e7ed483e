use std::path::PathBuf;

use tracing::error;

use argus_types::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("ARGUS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("argus.toml"));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("config error: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = argus_server::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
