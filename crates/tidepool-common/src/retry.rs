//! Retrying operations that fail transiently
//!
//! Two policies: exponential backoff with optional jitter, and a fixed pause
//! between a bounded number of attempts. Tunnel establishment uses the fixed
//! form; a probed-free local port can be claimed by another process before
//! the tunnel binds it, and a short pause lets that race clear.
//!
//! ```ignore
//! use tidepool_common::retry::{retry_with_backoff, RetryConfig};
//!
//! retry_with_backoff(
//!     &RetryConfig::fixed(5, Duration::from_secs(5)),
//!     "port_forward",
//!     || cluster.port_forward(&pod, local, remote),
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// How often and how patiently to retry
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts before giving up, 0 retries forever
    pub max_attempts: u32,
    /// Pause after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any pause
    pub max_delay: Duration,
    /// Growth factor applied to the pause after each failure
    pub backoff_multiplier: f64,
    /// Scale each pause by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff bounded to `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::default()
        }
    }

    /// Constant `delay` between at most `attempts` tries
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }

    /// Pause following `current`, capped at `max_delay`
    fn next_delay(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_multiplier)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds or `config` runs out of attempts
///
/// Returns the first success, or the error of the final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempts = attempt, error = %err, "Giving up");
            return Err(err);
        }

        let pause = config.jittered(delay);
        warn!(
            operation = %operation_name,
            attempt,
            max_attempts = config.max_attempts,
            error = %err,
            retry_in_ms = pause.as_millis(),
            "Attempt failed"
        );
        tokio::time::sleep(pause).await;
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    type Attempt = std::future::Ready<Result<u32, String>>;

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut() -> Attempt {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures {
                Err(format!("attempt {} refused", n + 1))
            } else {
                Ok(n + 1)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn third_attempt_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::fixed(5, Duration::from_secs(5));
        let result = retry_with_backoff(&config, "tunnel", flaky(2, calls.clone())).await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_is_returned_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::fixed(4, Duration::from_secs(1));
        let result = retry_with_backoff(&config, "tunnel", flaky(u32::MAX, calls.clone())).await;
        assert_eq!(result, Err("attempt 4 refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_policy_pauses_between_attempts_only() {
        let start = tokio::time::Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::fixed(5, Duration::from_secs(5));
        let _ = retry_with_backoff(&config, "tunnel", flaky(u32::MAX, calls)).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
    }

    #[test]
    fn backoff_grows_until_capped() {
        let config = RetryConfig {
            max_delay: Duration::from_millis(500),
            ..RetryConfig::default()
        };
        assert_eq!(config.next_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(config.next_delay(Duration::from_millis(400)), Duration::from_millis(500));

        let fixed = RetryConfig::fixed(3, Duration::from_secs(5));
        assert_eq!(fixed.next_delay(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_never_exhausts() {
        let config = RetryConfig::default();
        assert!(!config.exhausted(1_000));
        assert!(RetryConfig::with_max_attempts(2).exhausted(2));
    }
}
