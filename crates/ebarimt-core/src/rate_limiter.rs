use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter as GovernorLimiter};
use thiserror::Error;
use tokio::time::Instant;

type DirectRateLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Token bucket size and refill window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Bucket capacity; also the number of tokens refilled per `period`.
    pub calls: u32,
    pub period: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            calls: 100,
            period: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn pos() -> Self {
        Self {
            calls: 200,
            period: Duration::from_secs(60),
        }
    }

    pub fn public_api() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit exceeded for '{name}' after waiting {}ms", .waited.as_millis())]
pub struct RateLimitExceeded {
    pub name: String,
    pub waited: Duration,
}

/// In-process token bucket for one named dependency.
///
/// Tokens refill continuously at `calls / period`. State is never shared
/// between processes.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    limiter: DirectRateLimiter,
    clock: DefaultClock,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            limiter: GovernorLimiter::direct(quota_from_window(config.period, config.calls)),
            clock: DefaultClock::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Consume a token if one is available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Consume a token. Non-blocking calls return `Ok(false)` immediately when
    /// the bucket is empty; blocking calls poll until a token frees up or
    /// `timeout` elapses.
    pub async fn acquire(&self, blocking: bool, timeout: Duration) -> Result<bool, RateLimitExceeded> {
        if !blocking {
            return Ok(self.try_acquire());
        }

        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let Some(wait) = self.next_wait() else {
                return Ok(true);
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(limiter = %self.name, timeout_ms = timeout.as_millis() as u64, "rate limit wait timed out");
                return Err(RateLimitExceeded {
                    name: self.name.clone(),
                    waited: started.elapsed(),
                });
            }

            let sleep_for = wait.min(POLL_INTERVAL).min(remaining).max(Duration::from_millis(1));
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// `None` when a token was taken, otherwise the time until the next one.
    fn next_wait(&self) -> Option<Duration> {
        match self.limiter.check() {
            Ok(()) => None,
            Err(not_until) => Some(not_until.wait_time_from(self.clock.now())),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = quota_limit.max(1);
    let burst = NonZeroU32::new(safe_limit).expect("safe limit must be non-zero");

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit)).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .expect("period is always greater than zero")
        .allow_burst(burst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_capacity() {
        let limiter = RateLimiter::new(
            "pos",
            RateLimiterConfig {
                calls: 2,
                period: Duration::from_secs(60),
            },
        );

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn non_blocking_acquire_reports_empty_bucket() {
        let limiter = RateLimiter::new(
            "pos",
            RateLimiterConfig {
                calls: 1,
                period: Duration::from_secs(60),
            },
        );

        assert_eq!(limiter.acquire(false, Duration::ZERO).await, Ok(true));
        assert_eq!(limiter.acquire(false, Duration::ZERO).await, Ok(false));
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(
            "pos",
            RateLimiterConfig {
                calls: 1,
                period: Duration::from_millis(50),
            },
        );
        assert!(limiter.try_acquire());

        let started = std::time::Instant::now();
        assert_eq!(limiter.acquire(true, Duration::from_secs(1)).await, Ok(true));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn blocking_acquire_fails_after_timeout() {
        let limiter = RateLimiter::new(
            "public_api",
            RateLimiterConfig {
                calls: 1,
                period: Duration::from_secs(60),
            },
        );
        assert!(limiter.try_acquire());

        let error = limiter
            .acquire(true, Duration::from_millis(30))
            .await
            .expect_err("bucket stays empty");
        assert_eq!(error.name, "public_api");
        assert!(error.waited >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn bucket_refills_after_one_period() {
        let period = Duration::from_millis(60);
        let limiter = RateLimiter::new("pos", RateLimiterConfig { calls: 2, period });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert_eq!(limiter.acquire(false, Duration::ZERO).await, Ok(false));

        tokio::time::sleep(period + Duration::from_millis(10)).await;

        assert_eq!(limiter.acquire(false, Duration::ZERO).await, Ok(true));
        assert!(limiter.try_acquire());
    }
}
