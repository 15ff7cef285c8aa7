// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ReelHub Background Worker
//!
//! Handles scheduled jobs including:
//! - Billing invariant checks (hourly)
//! - Report of purchases awaiting reconciliation (every 15 minutes)
//! - Expiry of abandoned pending checkouts (daily at 03:30 UTC)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use reelhub_billing::{BillingService, PaymentProvider, PgBillingStore};
use reelhub_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting ReelHub Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let provider: PaymentProvider = std::env::var("PAYMENT_PROVIDER")
        .unwrap_or_else(|_| "stripe".to_string())
        .parse()?;

    let billing = match BillingService::from_env(Arc::new(PgBillingStore::new(pool)), provider) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without gateway credentials there is nothing useful to schedule
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Invariant checks (hourly)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                jobs::run_invariant_checks(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Job 2: Purchases awaiting reconciliation (every 15 minutes)
    let flagged_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = flagged_billing.clone();
            Box::pin(async move {
                jobs::report_flagged_purchases(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Reconciliation report (every 15 minutes)");

    // Job 3: Abandoned checkout expiry (daily at 03:30 UTC)
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                info!("Running stale checkout expiry");
                jobs::expire_stale_checkouts(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Stale checkout expiry (daily at 03:30 UTC)");

    // Job 4: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("ReelHub Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
