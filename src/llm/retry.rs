//! Retry policy for transient provider failures.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

use super::error::LlmError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry, before growth is applied
    pub initial_delay: Duration,
    /// Growth factor applied to the delay on every attempt
    pub exponential_base: f64,
    /// Randomize growth by up to one extra `exponential_base` factor
    pub jitter: bool,
    /// Maximum total time to spend retrying
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            exponential_base: 1.3,
            jitter: true,
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// A policy that fails on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Check if the given error should be retried based on this config.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        self.max_retries > 0 && error.is_transient()
    }

    /// Grow `delay` by one step: `delay * base * (1 + jitter * U[0,1))`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let jitter = if self.jitter {
            rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        delay.mul_f64(self.exponential_base * (1.0 + jitter))
    }
}

/// Run `op` until it succeeds, a non-transient error occurs, or the retry
/// budget (attempts or wall time) is exhausted.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        let error = match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        target_label = %label,
                        "Request succeeded after {} retries (total time: {:?})",
                        attempt,
                        start.elapsed()
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !config.should_retry(&error) || attempt >= config.max_retries {
            if attempt > 0 {
                tracing::error!(
                    target_label = %label,
                    "Request failed after {} retries (total time: {:?}): {}",
                    attempt,
                    start.elapsed(),
                    error
                );
            } else {
                tracing::error!(target_label = %label, "Request failed (non-retryable): {}", error);
            }
            return Err(error);
        }

        delay = config.next_delay(delay);
        let wait = error.retry_after.unwrap_or(delay);
        let remaining = config.max_retry_duration.saturating_sub(start.elapsed());
        if remaining.is_zero() || wait > remaining {
            tracing::warn!(
                target_label = %label,
                "Retry attempt {} failed, no time remaining: {}",
                attempt + 1,
                error
            );
            return Err(error);
        }

        tracing::warn!(
            target_label = %label,
            "Retry attempt {} failed with {}, retrying in {:?}: {}",
            attempt + 1,
            error.kind,
            wait,
            error.message
        );
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::error::LlmErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.initial_delay, Duration::from_secs(1));
        assert_eq!(cfg.exponential_base, 1.3);
        assert!(cfg.jitter);
    }

    #[test]
    fn test_should_retry_follows_error_kind() {
        let cfg = RetryConfig::default();
        assert!(cfg.should_retry(&LlmError::server_error(503, "busy".into())));
        assert!(cfg.should_retry(&LlmError::timeout("slow".into())));
        assert!(!cfg.should_retry(&LlmError::client_error(401, "key".into())));
        assert!(!RetryConfig::no_retry().should_retry(&LlmError::network_error("reset".into())));
    }

    #[test]
    fn test_delay_growth_bounds() {
        let cfg = RetryConfig::default();
        for _ in 0..50 {
            let d = cfg.next_delay(Duration::from_secs(1));
            assert!(d >= Duration::from_millis(1300));
            assert!(d < Duration::from_millis(2600));
        }
        let no_jitter = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(no_jitter.next_delay(Duration::from_secs(10)), Duration::from_secs(13));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&fast(), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LlmError::server_error(503, "busy".into()))
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&fast(), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::client_error(401, "bad key".into()))
        })
        .await;
        assert_eq!(result.unwrap_err().kind, LlmErrorKind::ClientError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let cfg = RetryConfig {
            max_retries: 2,
            ..fast()
        };
        let result: Result<(), _> = with_retry(&cfg, "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::network_error("reset".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_after_beyond_budget_stops() {
        let cfg = RetryConfig {
            max_retry_duration: Duration::from_millis(50),
            ..fast()
        };
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&cfg, "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::rate_limited("slow down".into(), Some(Duration::from_secs(30))))
        })
        .await;
        assert_eq!(result.unwrap_err().kind, LlmErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
