//! Background job: retention cleanup for the row store.
//!
//! Runs hourly. Approval rows older than 24 h are deleted (the stored
//! row is the only audit surface, and it is deliberately short-lived);
//! rate-limit events age out after 10 minutes.

use std::time::Duration;

use tokio::time;

use crate::store::RestStore;

const RUN_INTERVAL: Duration = Duration::from_secs(3600);
const REQUEST_RETENTION_HOURS: i64 = 24;
const RATE_LIMIT_RETENTION_MINUTES: i64 = 10;

/// Spawn the cleanup task. Call once at server startup.
pub fn spawn(store: RestStore) {
    tokio::spawn(async move {
        let mut interval = time::interval(RUN_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = run_once(&store).await {
                tracing::error!("cleanup job failed: {e:#}");
            }
        }
    });
}

async fn run_once(store: &RestStore) -> anyhow::Result<()> {
    let request_cutoff = chrono::Utc::now() - chrono::Duration::hours(REQUEST_RETENTION_HOURS);
    let deleted = store.delete_requests_older_than(request_cutoff).await?;
    if deleted > 0 {
        tracing::info!(rows = deleted, "deleted expired approval requests");
    }

    let event_cutoff =
        chrono::Utc::now() - chrono::Duration::minutes(RATE_LIMIT_RETENTION_MINUTES);
    let deleted = store.delete_rate_limit_events_older_than(event_cutoff).await?;
    if deleted > 0 {
        tracing::info!(rows = deleted, "deleted stale rate-limit events");
    }

    Ok(())
}
