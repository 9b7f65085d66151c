use mimalloc::MiMalloc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use user_store::{Config, UserStore};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        backend = ?cfg.backend,
        host = %cfg.store.host,
        port = cfg.store.port,
        db = %cfg.store.db,
        table = %cfg.store.table,
        retry_delay_ms = cfg.retry.delay_ms,
        loglevel = %cfg.loglevel
    );

    let store = UserStore::from_config(&cfg).await?;
    if let Err(e) = store.set_up().await {
        error!("Users setup failed: {}", e);
        store.close().await;
        return Err(e.into());
    }
    info!("Users set up done; waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    store.close().await;
    Ok(())
}
