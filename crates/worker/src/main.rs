//! Patronage Background Worker
//!
//! Runs the scheduled jobs that depend on subscription state:
//! - Daily renewal reminder / failed-charge notification run
//!   (configurable hour and minute, defaults to 09:00 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use patronage_billing::BillingService;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Daily reminder schedule from SCHEDULER_HOUR / SCHEDULER_MINUTE.
/// Out-of-range values are a fatal configuration error.
fn reminder_schedule() -> anyhow::Result<String> {
    let hour: u8 = match std::env::var("SCHEDULER_HOUR") {
        Ok(raw) => raw.parse()?,
        Err(_) => 9,
    };
    let minute: u8 = match std::env::var("SCHEDULER_MINUTE") {
        Ok(raw) => raw.parse()?,
        Err(_) => 0,
    };
    if hour > 23 || minute > 59 {
        anyhow::bail!("SCHEDULER_HOUR/SCHEDULER_MINUTE out of range: {hour}:{minute}");
    }

    Ok(format!("0 {minute} {hour} * * *"))
}

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

    info!("Starting Patronage Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = patronage_shared::create_pool(&database_url).await?;

    let billing = match BillingService::from_env(pool) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If the gateway or mail provider isn't configured, run in
            // minimal mode rather than crash-looping the deployment.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Daily reminder run. The service skips a trigger if the
    // previous run is still in progress instead of queueing it.
    let schedule = reminder_schedule()?;
    let reminder_billing = billing.clone();
    scheduler
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let billing = reminder_billing.clone();
            Box::pin(async move {
                info!("Running scheduled reminder job");
                match billing.reminders.run().await {
                    Ok(summary) if summary.skipped => {
                        warn!("Reminder run skipped, previous run still in progress");
                    }
                    Ok(summary) => {
                        info!(
                            reminders = summary.reminders,
                            failed = summary.failed,
                            declined = summary.declined,
                            "Reminder run complete"
                        );
                    }
                    Err(e) => {
                        // Aborts this run only; the next trigger
                        // proceeds independently.
                        error!(error = %e, "Reminder run failed");
                    }
                }
            })
        })?)
        .await?;
    info!(schedule = %schedule, "Scheduled: daily reminder run");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // Keep the main task running; jobs fire on background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_string_is_daily_at_configured_time() {
        // Avoid env mutation in tests; exercise the formatting
        // directly through the default path.
        if std::env::var("SCHEDULER_HOUR").is_err() && std::env::var("SCHEDULER_MINUTE").is_err() {
            assert_eq!(reminder_schedule().unwrap(), "0 0 9 * * *");
        }
    }
}
