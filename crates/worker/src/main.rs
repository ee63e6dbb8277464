// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Hotspot Background Worker
//!
//! Handles scheduled jobs including:
//! - Billing invariant sweep (hourly)
//! - Callback journal pruning (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use hotspot_billing::{InvariantCheckSummary, InvariantChecker, PgCentralStore, ViolationSeverity};
use hotspot_shared::{create_pool, init_tracing, PoolSettings};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_CALLBACK_RETENTION_DAYS: i64 = 90;

/// Journal rows older than this are deleted
fn callback_retention() -> time::Duration {
    let days = std::env::var("CALLBACK_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|days| *days > 0)
        .unwrap_or(DEFAULT_CALLBACK_RETENTION_DAYS);
    time::Duration::days(days)
}

/// Log results of an invariant sweep
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants healthy");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant sweep found violations"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                tenant_ids = ?violation.tenant_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                tenant_ids = ?violation.tenant_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing("info");

    info!("Starting Hotspot Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(
        &database_url,
        PoolSettings {
            max_connections: 5,
            ..PoolSettings::default()
        },
    )
    .await?;

    let central = PgCentralStore::new(pool);
    let checker = Arc::new(InvariantChecker::new(Arc::new(central.clone())));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Invariant sweep (hourly)
    let sweep_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = sweep_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant sweep");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant sweep (hourly)");

    // Job 2: Prune the callback journal (daily at 3:00 AM UTC)
    let retention = callback_retention();
    let prune_store = central.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let store = prune_store.clone();
            Box::pin(async move {
                let cutoff = OffsetDateTime::now_utc() - retention;
                match store.prune_callbacks(cutoff).await {
                    Ok(deleted) => info!(deleted, "Pruned callback journal"),
                    Err(e) => error!(error = %e, "Failed to prune callback journal"),
                }
            })
        })?)
        .await?;
    info!(
        retention_days = retention.whole_days(),
        "Scheduled: Callback journal pruning (daily at 3:00 AM UTC)"
    );

    // Job 3: Heartbeat (every 5 minutes)
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

    info!("Hotspot Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
