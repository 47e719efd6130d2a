use tracing_subscriber::EnvFilter;

use vellum_updater::config::UpdaterConfig;
use vellum_updater::startup;

#[tokio::main]
async fn main() {
    let config = UpdaterConfig::from_env();

    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(error) = startup::run(config).await {
        eprintln!("vellum-updater failed: {error:#}");
        std::process::exit(1);
    }
}
