use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Outcome of a failed transfer (download or upload), classified for retry
#[derive(Debug, Error)]
pub enum TransferError {
    /// Worth retrying: timeouts, connection resets, 5xx, 429
    #[error("transient transfer failure: {0:#}")]
    Transient(anyhow::Error),

    /// Retrying cannot help: 4xx, rejected by the remote, local I/O
    #[error("transfer failed: {0:#}")]
    Permanent(anyhow::Error),
}

impl TransferError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Classify a reqwest failure
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let retryable_status = err
            .status()
            .is_some_and(|s| s.is_server_error() || s.as_u16() == 429);

        if err.is_timeout() || err.is_connect() || err.is_request() || retryable_status {
            Self::Transient(err.into())
        } else {
            Self::Permanent(err.into())
        }
    }

    /// Classify an unsuccessful HTTP status
    pub fn from_status(status: reqwest::StatusCode, what: String) -> Self {
        let err = anyhow::anyhow!("{what}: HTTP status {status}");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::Transient(err)
        } else {
            Self::Permanent(err)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Bounded exponential backoff for transfers
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Tight policy for tests and mock servers
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            multiplier: 1.0,
            max_interval: Duration::from_millis(1),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval)
            .with_randomization_factor(0.1)
            // attempts bound the retry, not wall time
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent. The last error is returned.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    backoff::future::retry(policy.backoff(), || {
        attempt += 1;
        let current_attempt = attempt;
        let fut = operation();

        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() && current_attempt < max_attempts => {
                    warn!("{what} failed (attempt {current_attempt}/{max_attempts}), retrying: {e}");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}
