//! Lumiproof Background Worker
//!
//! Handles scheduled jobs including:
//! - Tolerance-window expiry sweep (every 5 minutes): applies the free
//!   transition to users whose pending downgrade came due
//! - Idempotency ledger cleanup (hourly)
//! - Health check heartbeat (every 5 minutes)
//!
//! The sweep is the only path that mutates subscription state without an
//! inbound webhook triggering it.

use std::sync::Arc;
use std::time::Duration;

use lumiproof_billing::{
    EngineConfig, InMemoryUserStore, LoggingNotifier, OfferCatalog, SubscriptionEngine,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Lumiproof Worker");

    let config = EngineConfig::from_env();
    // Single-process deployment wiring. A persistent UserStore
    // implementation plugs into the same constructor.
    let engine = Arc::new(SubscriptionEngine::new(
        config,
        OfferCatalog::default(),
        Arc::new(InMemoryUserStore::new()),
        Arc::new(LoggingNotifier),
    ));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Tolerance-window expiry sweep (every 5 minutes)
    let sweep_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let engine = sweep_engine.clone();
            Box::pin(async move {
                info!("Running downgrade sweep");
                match engine.run_downgrade_sweep().await {
                    Ok(stats) => {
                        info!(
                            examined = stats.examined,
                            downgraded = stats.downgraded,
                            failed = stats.failed,
                            "Downgrade sweep cycle complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Downgrade sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Downgrade sweep (every 5 minutes)");

    // Job 2: Idempotency ledger cleanup (hourly)
    let cleanup_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let engine = cleanup_engine.clone();
            Box::pin(async move {
                let removed = engine
                    .ledger()
                    .cleanup(time::OffsetDateTime::now_utc())
                    .await;
                info!(removed, "Idempotency ledger cleanup complete");
            })
        })?)
        .await?;
    info!("Scheduled: Idempotency ledger cleanup (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Lumiproof Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
