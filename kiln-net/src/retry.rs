// kiln-net/src/retry.rs
use std::future::Future;
use std::time::Duration;

use kiln_common::config::FetchSettings;
use kiln_common::error::{KilnError, Result};
use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl From<&FetchSettings> for RetryPolicy {
    fn from(settings: &FetchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            attempt_timeout: settings.timeout,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: exponential, capped, with up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let base = exp.min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Runs a network operation under the retry policy.
///
/// Transient failures and timeouts are retried. Once retries are exhausted, or on a
/// non-transient failure, the error becomes `FetchFailed` carrying the attempt count.
/// `ChecksumMismatch` and `Cancelled` are returned unchanged.
pub async fn fetch_with_retry<T, F, Fut>(policy: &RetryPolicy, url: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        debug!("Fetching {} (attempt {}/{})", url, attempt, policy.max_attempts);

        let result = match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(KilnError::Network(format!(
                "timed out after {}",
                humantime::format_duration(policy.attempt_timeout)
            ))),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e @ (KilnError::ChecksumMismatch { .. } | KilnError::Cancelled)) => return Err(e),
            Err(e) => e,
        };

        if err.is_retryable() && attempt < policy.max_attempts {
            let delay = policy.backoff(attempt);
            warn!(
                "Fetching {} failed (attempt {}/{}): {}. Retrying in {:?}",
                url, attempt, policy.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return Err(KilnError::FetchFailed {
            url: url.to_string(),
            attempts: attempt,
            reason: err.to_string(),
        });
    }
}
