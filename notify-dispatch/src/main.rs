use std::sync::Arc;

use notify_dispatch::config::AppConfig;
use notify_dispatch::database::Database;
use notify_dispatch::logging::init_logging;
use notify_dispatch::notification::{ChannelRegistry, NotificationService};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let (logging, _guard) = init_logging(&config.log_dir)?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let db = Database::open(&config.database_url).await?;
    let registry = Arc::new(ChannelRegistry::with_defaults()?);
    let service = NotificationService::new(&db, registry, config.dispatch.clone())?;

    service.start();
    tracing::info!(
        database_url = %config.database_url,
        log_dir = %logging.log_dir().display(),
        kinds = ?service.supported_kinds(),
        "notify-dispatch started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    service.stop().await;
    db.write_pool.close().await;
    db.pool.close().await;

    Ok(())
}
