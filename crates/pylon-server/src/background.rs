//! Background maintenance tasks.
//!
//! One loop handles both periodic duties: sweeping request-log rows past
//! the retention horizon and dropping idle counter cells. Interval and
//! horizon are re-read from the current policy every pass, so a hot policy
//! update takes effect on the next iteration.

use crate::AppState;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Runs the retention sweep until the task is dropped at shutdown.
pub async fn start_retention_task(state: Arc<AppState>) {
    tracing::info!("starting request-log retention task");

    loop {
        let policy = state.gate.current_policy();
        let interval = Duration::from_secs(policy.retention.sweep_interval_secs);
        sleep(interval).await;

        state.gate.sweep_idle();

        let cutoff = (Utc::now()
            - chrono::Duration::days(i64::from(policy.retention.request_log_days)))
        .to_rfc3339();

        let pool = state.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            pylon_record::delete_before(&conn, &cutoff).map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(Ok(deleted)) => {
                if deleted > 0 {
                    tracing::info!(deleted, "swept expired request-log rows");
                } else {
                    tracing::debug!("no expired request-log rows to sweep");
                }
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "request-log sweep failed");
            }
            Err(e) => {
                tracing::error!(error = %e, "retention task panicked or was cancelled");
            }
        }
    }
}
