use sdrop::config::Config;
use sdrop::runtime::signals;
use sdrop::server::Server;
use sdrop::sync::AliveFlag;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Before any worker thread exists, so the signal mask is inherited.
    let alive = AliveFlag::new();
    signals::install(alive.clone())?;

    info!(
        listen = ?config.listen,
        root = %config.root.display(),
        isolate = config.isolate,
        threads = config.threads,
        scheduler = ?config.scheduler,
        "Starting sdrop server"
    );

    let server = Server::from_config(&config, alive)?;
    server.run(None);

    info!("Shut down");
    Ok(())
}
