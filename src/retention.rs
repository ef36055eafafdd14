/// Periodic cleanup of spent refresh-token records.
///
/// Deletes records that expired, or were consumed, more than the configured
/// retention period ago. Live tokens are never touched.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::auth::AuthenticationService;
use crate::configuration::AuthSettings;

/// Run a single purge pass, logging the outcome.
pub async fn purge_once(service: &AuthenticationService, retention_days: i64) {
    match service
        .purge_expired_tokens(chrono::Duration::days(retention_days))
        .await
    {
        Ok(deleted) if deleted > 0 => {
            tracing::info!(deleted, "Refresh token retention: purged old records");
        }
        Ok(_) => tracing::debug!("Refresh token retention: nothing to purge"),
        Err(e) => {
            tracing::error!(
                error = %e,
                retryable = e.is_retryable(),
                "Refresh token retention: cleanup failed"
            );
        }
    }
}

/// Spawn the retention loop. The first pass runs immediately.
///
/// Abort the returned handle to stop the job.
pub fn spawn(service: AuthenticationService, settings: &AuthSettings) -> JoinHandle<()> {
    let retention_days = settings.refresh_token_retention_days;
    let period = Duration::from_secs(settings.purge_interval_secs.max(1));

    tracing::info!(
        retention_days,
        interval_secs = period.as_secs(),
        "Refresh token retention job started"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            purge_once(&service, retention_days).await;
        }
    })
}
