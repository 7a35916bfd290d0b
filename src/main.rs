use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod audit;
mod config;
mod crypto;
mod error;
mod ledger;
mod store;

use audit::AuditEventLog;
use config::AppConfig;
use crypto::{KeyPoolManager, KeyStorage, RotationConfig, RotationScheduler, SignatureEngine};
use store::Database;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recordchain=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting recordchain audit service");

    let config = AppConfig::load()?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    info!("Database ready");

    let storage = Arc::new(KeyStorage::new(
        &config.secret,
        &config.passphrase_path,
        &config.key_dir,
    )?);
    if !storage.seeds_exist() {
        info!("No seed archive found; bootstrapping");
        storage.bootstrap_seeds(config.seed_count)?;
    }

    let pool = {
        let storage = storage.clone();
        let pool_size = config.pool_size;
        let shift_interval = config.shift_interval;
        tokio::task::spawn_blocking(move || {
            KeyPoolManager::initialize(storage, pool_size, shift_interval)
        })
        .await??
    };
    let pool = Arc::new(pool);
    info!(pool_size = pool.pool_len(), "Key pool ready");

    let engine = Arc::new(SignatureEngine::new(pool, storage.clone()));
    let event_log = Arc::new(AuditEventLog::new(&config.audit_log_path)?);
    event_log.log_event("Audit service started")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = RotationScheduler::new(
        engine,
        storage,
        RotationConfig {
            shift_interval: config.shift_interval,
            regenerate_interval: config.regenerate_interval,
            overlap_window: config.overlap_window,
            ..RotationConfig::default()
        },
        shutdown_rx,
    );
    let rotation = tokio::spawn(scheduler.run());
    info!("Rotation scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown_tx.send(true)?;
    rotation.await?;

    event_log.log_event("Audit service stopped")?;
    Ok(())
}
