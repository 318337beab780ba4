//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::ClientError;
use crate::http_client::HttpErrorKind;

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Uses an exponential delay between retries.
    ///
    /// The delay is calculated as `base * (factor ^ attempt)`, capped at `max`.
    Exponential {
        /// The initial backoff duration.
        base: Duration,
        /// The multiplicative factor for each subsequent retry.
        factor: f64,
        /// The maximum duration to wait between retries.
        max: Duration,
        /// Whether to apply random jitter (+/- 50%) to the delay.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt + 1` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let scale = factor.powi(attempt.min(i32::MAX as u32) as i32);
                let seconds = base.as_secs_f64() * scale;
                let capped_seconds = seconds.min(max.as_secs_f64());

                let mut delay = Duration::from_secs_f64(capped_seconds);

                if jitter {
                    let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
                    let random_offset = fastrand::u64(0..=(jitter_ms * 2));
                    let total_ms =
                        delay.as_millis() as i64 + (random_offset as i64 - jitter_ms as i64);
                    delay = Duration::from_millis(total_ms.max(0) as u64);
                }

                delay
            }
        }
    }
}

/// Configuration for inline retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Enables or disables the retry mechanism.
    pub enabled: bool,
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// HTTP status codes that trigger a retry.
    pub retry_on_status: Vec<u16>,
    pub retry_on_timeout: bool,
    pub retry_on_connect: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Backoff::default(),
            retry_on_status: vec![429, 500, 502, 503, 504],
            retry_on_timeout: true,
            retry_on_connect: true,
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    /// Toggle +/- 50% jitter. Fixed backoff has no jitter and is unchanged.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        if let Backoff::Exponential { jitter, .. } = &mut self.backoff {
            *jitter = enabled;
        }
        self
    }

    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    /// Whether `error` belongs to the configured retryable kinds.
    pub fn should_retry(&self, error: &ClientError) -> bool {
        match error {
            ClientError::Api { status, .. } => self.should_retry_status(*status),
            ClientError::Transport(error) => match error.kind() {
                HttpErrorKind::Timeout => self.retry_on_timeout,
                HttpErrorKind::Connect => self.retry_on_connect,
                HttpErrorKind::Other => false,
            },
            _ => false,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or `max_retries` retries are spent. The last error is returned.
///
/// `on_retry` receives the error and the 1-based number of the retry about to
/// be made, before the backoff sleep.
pub async fn retry_with_backoff<T, E, F, Fut, P, R>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    R: FnMut(&E, u32),
{
    let mut attempt = 0_u32;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !config.enabled || attempt >= config.max_retries || !should_retry(&error) {
            return Err(error);
        }

        on_retry(&error, attempt + 1);
        let delay = config.delay_for_attempt(attempt);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(100),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff_with_jitter_stays_in_band() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        };

        for _ in 0..10 {
            for attempt in 0..5 {
                let delay_ms = backoff.delay(attempt).as_millis() as f64;
                let expected = (100.0 * 2_f64.powi(attempt as i32)).min(1000.0);
                assert!(delay_ms >= expected * 0.49, "attempt={attempt}, delay_ms={delay_ms}");
                assert!(delay_ms <= expected * 1.51, "attempt={attempt}, delay_ms={delay_ms}");
            }
        }
    }

    #[test]
    fn jitter_toggle_only_touches_exponential_backoff() {
        let config = RetryConfig::exponential(2).with_jitter(true);
        assert!(matches!(config.backoff, Backoff::Exponential { jitter: true, .. }));

        let fixed = RetryConfig::fixed(Duration::from_millis(5), 1).with_jitter(true);
        assert_eq!(fixed.backoff, Backoff::Fixed { delay: Duration::from_millis(5) });
    }

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();

        assert!(config.enabled);
        assert_eq!(config.max_retries, 3);
        assert!(config.should_retry(&ClientError::Api {
            status: 503,
            message: String::new()
        }));
        assert!(!config.should_retry(&ClientError::Api {
            status: 400,
            message: String::new()
        }));
        assert!(config.should_retry(&ClientError::Transport(HttpError::timeout("slow"))));
        assert!(!config.should_retry(&ClientError::Auth("bad".to_string())));
    }

    #[test]
    fn test_retry_config_no_retry() {
        let config = RetryConfig::no_retry();

        assert!(!config.enabled);
        assert_eq!(config.max_retries, 0);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let config = RetryConfig::fixed(Duration::from_millis(5), 3);
        let calls = &AtomicU32::new(0);
        let mut retries = Vec::new();

        let result: Result<u32, &str> = retry_with_backoff(
            &config,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("flaky")
                } else {
                    Ok(n)
                }
            },
            |_| true,
            |_, attempt| retries.push(attempt),
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn non_matching_errors_propagate_immediately() {
        let config = RetryConfig::fixed(Duration::from_millis(5), 3);
        let calls = &AtomicU32::new(0);

        let result: Result<(), &str> = retry_with_backoff(
            &config,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("validation")
            },
            |error| *error != "validation",
            |_, _| {},
        )
        .await;

        assert_eq!(result, Err("validation"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries_with_last_error() {
        let config = RetryConfig::fixed(Duration::from_millis(1), 2);
        let calls = &AtomicU32::new(0);

        let result: Result<(), u32> = retry_with_backoff(
            &config,
            move || async move { Err(calls.fetch_add(1, Ordering::SeqCst)) },
            |_| true,
            |_, _| {},
        )
        .await;

        assert_eq!(result, Err(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn waits_at_least_the_sum_of_backoff_delays() {
        let config = RetryConfig {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(10),
                factor: 2.0,
                max: Duration::from_secs(1),
                jitter: false,
            },
            ..RetryConfig::default()
        };
        let expected: Duration = (0..config.max_retries).map(|attempt| config.delay_for_attempt(attempt)).sum();
        assert_eq!(expected, Duration::from_millis(70));

        let started = tokio::time::Instant::now();
        let result: Result<(), &str> =
            retry_with_backoff(&config, || async { Err("down") }, |_| true, |_, _| {}).await;

        assert_eq!(result, Err("down"));
        assert!(started.elapsed() >= expected, "elapsed {:?}", started.elapsed());
    }
}
