//! # Connection Retry Policy
//!
//! Waits for a freshly obtained database handle to become usable. The exporter is often
//! launched alongside its database container, so the first probes may hit a port nobody is
//! listening on yet. Those refusals are retried at a fixed interval up to a bounded number of
//! attempts; any other failure aborts immediately.

use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::RunConfiguration;
use crate::database::SourceDatabase;
use crate::error::{ExporterError, Result};

/// Outcome of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Number of probes issued, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRetryPolicy {
    attempts: u32,
    interval: Duration,
}

impl ConnectionRetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &RunConfiguration) -> Self {
        Self::new(
            config.connection_attempts,
            Duration::from_millis(config.connection_interval_ms),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe `db` until it answers, a non-transient error occurs, or attempts run out.
    pub async fn wait_for_connection(&self, db: &dyn SourceDatabase) -> Result<RetryOutcome> {
        let start = Instant::now();
        info!(
            attempts = self.attempts,
            interval_ms = self.interval.as_millis() as u64,
            dialect = %db.dialect(),
            "Wait for Connection Started"
        );

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match db.probe().await {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    info!(
                        attempt = attempt,
                        elapsed_sec = elapsed.as_secs_f64(),
                        "Wait for Connection Success"
                    );
                    return Ok(RetryOutcome {
                        attempts: attempt,
                        elapsed,
                    });
                }
                Err(err) if err.is_retryable() => {
                    let keep_trying = attempt < self.attempts;
                    info!(
                        attempt = attempt,
                        attempts = self.attempts,
                        keep_trying = keep_trying,
                        "Connection Refused"
                    );
                    debug!(error = %err, "Connection probe failure detail");
                    last_error = Some(err);
                    if keep_trying {
                        tokio::time::sleep(self.interval).await;
                    }
                }
                Err(err) => {
                    error!(
                        attempt = attempt,
                        error = %err,
                        error_kind = err.kind(),
                        "Wait for Connection Failure"
                    );
                    return Err(err);
                }
            }
        }

        let err = ExporterError::RetriesExhausted {
            attempts: self.attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no probe was issued".to_string()),
        };
        error!(
            elapsed_sec = start.elapsed().as_secs_f64(),
            error = %err,
            "Wait for Connection Failure"
        );
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_never_has_zero_attempts() {
        let policy = ConnectionRetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.attempts(), 1);
    }
}
