use anyhow::{Context, Result};
use routing_db::{connect, Clock, Database, RouteStore, SystemClock};
use routing_handlers::ApiMetrics;
use routing_migration::{builtin_registry, MigrationRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{LogFormat, ServiceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::load()?;
    init_tracing(config.logging.format);

    info!("Starting routing-server...");
    info!("  - Backend: {:?}", config.db.backend);
    info!("  - Sweep interval: {:?}", config.sweep_interval());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = connect(&config.db, clock)
        .await
        .context("failed to open route storage")?;

    let registry = Arc::new(builtin_registry()?);
    let runner = MigrationRunner::new(db.clone(), registry, config.runner_config());
    match runner.run().await {
        Ok(report) => info!(
            "Storage at migration {:?} (applied {:?})",
            report.version, report.applied
        ),
        Err(e) => {
            error!("Migrations failed, refusing to start: {}", e);
            return Err(e).context("startup migrations failed");
        }
    }

    let metrics = ApiMetrics::new()?;
    info!("Metrics registry initialized");

    tokio::select! {
        _ = sweep_expired_routes(db, metrics.clone(), config.sweep_interval()) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
    }

    debug!("Final metrics:\n{}", metrics.gather()?);
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Periodically remove entries whose TTL elapsed without renewal
async fn sweep_expired_routes(db: Arc<dyn Database>, metrics: ApiMetrics, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match db.sweep_expired().await {
            Ok(0) => debug!("No expired route entries"),
            Ok(removed) => {
                metrics.record_swept(removed);
                info!("Removed {} expired route entries", removed);
            }
            Err(e) => warn!("Route sweep failed: {}", e),
        }
    }
}
