use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::Cache;
use crate::timestamp::UtcDateTime;

/// Runtime circuit state for an upstream dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    /// How long persisted state lives in the shared cache.
    pub state_ttl: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            state_ttl: Duration::from_secs(3600),
        }
    }
}

impl CircuitBreakerConfig {
    /// POS API: local terminal, fails fast and recovers quickly.
    pub fn pos() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    pub fn public_api() -> Self {
        Self::default()
    }
}

/// Returned instead of calling a dependency whose circuit is open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit breaker '{name}' is open, retry after {} seconds", .recovery_timeout.as_secs())]
pub struct CircuitOpenError {
    pub name: String,
    pub recovery_timeout: Duration,
}

/// How a failed call counts toward the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    /// The dependency is failing. Counts toward opening, reopens from HalfOpen.
    Failure,
    /// The dependency answered and refused the request. Closes a HalfOpen
    /// circuit like a success, leaves a Closed count alone.
    Answered,
    /// The call never reached the dependency. Gives a HalfOpen trial slot back.
    NotSent,
}

/// Breaker state as persisted in the shared cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<UtcDateTime>,
    pub half_open_calls: u32,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_calls: 0,
        }
    }
}

/// Named circuit breaker whose state is shared through a [`Cache`].
///
/// State is re-read from the cache before every decision and written back on
/// every transition, so all processes sharing the cache observe one breaker.
/// Updates are read-modify-write without a cross-process lock; concurrent
/// failures may undercount, which only delays opening.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    cache: Arc<dyn Cache>,
    local: Mutex<CircuitSnapshot>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, cache: Arc<dyn Cache>) -> Self {
        Self {
            name: name.into(),
            config,
            cache,
            local: Mutex::new(CircuitSnapshot::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn cache_key(&self) -> String {
        format!("circuit_breaker:{}", self.name)
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        self.load().await
    }

    pub async fn state(&self) -> CircuitState {
        self.load().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.load().await.failure_count
    }

    /// Open and still inside the recovery window.
    pub async fn is_open(&self) -> bool {
        let snapshot = self.load().await;
        snapshot.state == CircuitState::Open && !self.recovery_elapsed(&snapshot)
    }

    /// Gate a call. Moves Open to HalfOpen once the recovery timeout has passed
    /// and admits at most `half_open_max_calls` further trial calls while HalfOpen.
    /// The call that makes the transition is not counted against that budget.
    pub async fn allow_request(&self) -> Result<(), CircuitOpenError> {
        let mut snapshot = self.load().await;

        if snapshot.state == CircuitState::Open {
            if !self.recovery_elapsed(&snapshot) {
                return Err(self.open_error());
            }
            snapshot.state = CircuitState::HalfOpen;
            snapshot.half_open_calls = 0;
            self.save(&snapshot).await;
            tracing::info!(breaker = %self.name, "circuit breaker half-open, testing recovery");
            return Ok(());
        }

        if snapshot.state == CircuitState::HalfOpen {
            if snapshot.half_open_calls >= self.config.half_open_max_calls {
                return Err(self.open_error());
            }
            snapshot.half_open_calls = snapshot.half_open_calls.saturating_add(1);
            self.save(&snapshot).await;
        }

        Ok(())
    }

    pub async fn record_success(&self) {
        let mut snapshot = self.load().await;
        match snapshot.state {
            CircuitState::HalfOpen => {
                snapshot = CircuitSnapshot::default();
                tracing::info!(breaker = %self.name, "circuit breaker closed after successful trial call");
            }
            CircuitState::Closed if snapshot.failure_count > 0 => {
                snapshot.failure_count = 0;
            }
            _ => return,
        }
        self.save(&snapshot).await;
    }

    pub async fn record_failure(&self) {
        let mut snapshot = self.load().await;
        snapshot.failure_count = snapshot.failure_count.saturating_add(1);
        snapshot.last_failure_time = Some(UtcDateTime::now());

        match snapshot.state {
            CircuitState::HalfOpen => {
                snapshot.state = CircuitState::Open;
                tracing::warn!(breaker = %self.name, "circuit breaker reopened after failed trial call");
            }
            CircuitState::Closed if snapshot.failure_count >= self.config.failure_threshold => {
                snapshot.state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failures = snapshot.failure_count,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
        self.save(&snapshot).await;
    }

    /// A trial call answered with a refusal: the dependency is reachable again.
    pub async fn record_answer(&self) {
        if self.load().await.state == CircuitState::HalfOpen {
            self.record_success().await;
        }
    }

    /// A trial call that never reached the dependency returns its slot.
    pub async fn release_trial_slot(&self) {
        let mut snapshot = self.load().await;
        if snapshot.state == CircuitState::HalfOpen && snapshot.half_open_calls > 0 {
            snapshot.half_open_calls -= 1;
            self.save(&snapshot).await;
        }
    }

    /// Force Closed with zero failures.
    pub async fn reset(&self) {
        self.save(&CircuitSnapshot::default()).await;
        tracing::info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Run `operation` through the breaker, counting every error as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        E: From<CircuitOpenError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(operation, |_| ErrorVerdict::Failure).await
    }

    /// Run `operation` through the breaker, letting `classify` decide how
    /// each error counts. Every admitted call settles the breaker, so a
    /// HalfOpen circuit always leaves HalfOpen or frees the trial slot.
    pub async fn call_with<T, E, F, Fut, P>(&self, operation: F, classify: P) -> Result<T, E>
    where
        E: From<CircuitOpenError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> ErrorVerdict,
    {
        self.allow_request().await?;

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(error) => {
                match classify(&error) {
                    ErrorVerdict::Failure => self.record_failure().await,
                    ErrorVerdict::Answered => self.record_answer().await,
                    ErrorVerdict::NotSent => self.release_trial_slot().await,
                }
                Err(error)
            }
        }
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            recovery_timeout: self.config.recovery_timeout,
        }
    }

    fn recovery_elapsed(&self, snapshot: &CircuitSnapshot) -> bool {
        snapshot
            .last_failure_time
            .map_or(true, |last_failure| last_failure.elapsed() >= self.config.recovery_timeout)
    }

    async fn load(&self) -> CircuitSnapshot {
        let key = self.cache_key();
        let loaded = match self.cache.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<CircuitSnapshot>(value) {
                Ok(snapshot) => Some(snapshot),
                Err(error) => {
                    tracing::warn!(breaker = %self.name, %error, "discarding unreadable circuit state");
                    Some(CircuitSnapshot::default())
                }
            },
            Ok(None) => Some(CircuitSnapshot::default()),
            Err(error) => {
                tracing::warn!(breaker = %self.name, %error, "circuit state cache unavailable, using local state");
                None
            }
        };

        let mut local = self
            .local
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match loaded {
            Some(snapshot) => {
                *local = snapshot.clone();
                snapshot
            }
            None => local.clone(),
        }
    }

    async fn save(&self, snapshot: &CircuitSnapshot) {
        {
            let mut local = self
                .local
                .lock()
                .expect("circuit breaker lock is not poisoned");
            *local = snapshot.clone();
        }

        let value = match serde_json::to_value(snapshot) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(breaker = %self.name, %error, "failed to encode circuit state");
                return;
            }
        };
        let key = self.cache_key();
        if let Err(error) = self.cache.set(&key, value, Some(self.config.state_ttl)).await {
            tracing::warn!(breaker = %self.name, %error, "failed to persist circuit state");
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("cache", &self.cache.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn breaker(threshold: u32, recovery: Duration, cache: Arc<dyn Cache>) -> CircuitBreaker {
        CircuitBreaker::new(
            "pos",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                half_open_max_calls: 1,
                state_ttl: Duration::from_secs(60),
            },
            cache,
        )
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = breaker(2, Duration::from_secs(60), Arc::new(MemoryCache::new()));

        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(breaker.allow_request().await.is_err());
        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout_then_closes_on_success() {
        let breaker = breaker(1, Duration::from_millis(5), Arc::new(MemoryCache::new()));

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.allow_request().await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_trial_calls() {
        let breaker = breaker(1, Duration::from_millis(5), Arc::new(MemoryCache::new()));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The transition call plus one counted trial call.
        assert!(breaker.allow_request().await.is_ok());
        assert!(breaker.allow_request().await.is_ok());
        let rejected = breaker.allow_request().await.expect_err("trial budget spent");
        assert_eq!(rejected.name, "pos");
    }

    #[tokio::test]
    async fn refused_trial_calls_close_the_circuit() {
        let breaker = breaker(1, Duration::from_millis(5), Arc::new(MemoryCache::new()));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let refused: Result<(), ClientFailure> = breaker
            .call_with(|| async { Err(ClientFailure::Refused) }, |_| ErrorVerdict::Answered)
            .await;

        assert_eq!(refused, Err(ClientFailure::Refused));
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test]
    async fn unsent_trial_calls_give_their_slot_back() {
        let breaker = breaker(1, Duration::from_millis(5), Arc::new(MemoryCache::new()));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.allow_request().await.is_ok());

        for _ in 0..3 {
            let _: Result<(), ClientFailure> = breaker
                .call_with(|| async { Err(ClientFailure::Refused) }, |_| ErrorVerdict::NotSent)
                .await;
        }

        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        let trial: Result<(), ClientFailure> = breaker.call(|| async { Ok(()) }).await;
        assert_eq!(trial, Ok(()));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_trial_call_reopens_the_circuit() {
        let breaker = breaker(3, Duration::from_millis(5), Arc::new(MemoryCache::new()));
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result: Result<(), ClientFailure> = breaker
            .call(|| async { Err(ClientFailure::Down) })
            .await;
        assert_eq!(result, Err(ClientFailure::Down));
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_does_not_invoke_operation() {
        let breaker = breaker(1, Duration::from_secs(60), Arc::new(MemoryCache::new()));
        breaker.record_failure().await;

        let mut invoked = false;
        let result: Result<(), ClientFailure> = breaker
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(ClientFailure::Open));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn ignored_errors_do_not_count_as_failures() {
        let breaker = breaker(1, Duration::from_secs(60), Arc::new(MemoryCache::new()));

        let _: Result<(), ClientFailure> = breaker
            .call_with(|| async { Err(ClientFailure::Down) }, |_| ErrorVerdict::Answered)
            .await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn state_is_shared_through_the_cache() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let worker_a = breaker(2, Duration::from_secs(60), Arc::clone(&cache));
        let worker_b = breaker(2, Duration::from_secs(60), Arc::clone(&cache));

        worker_a.record_failure().await;
        worker_b.record_failure().await;

        assert_eq!(worker_a.state().await, CircuitState::Open);
        worker_b.reset().await;
        assert_eq!(worker_a.state().await, CircuitState::Closed);
    }

    #[derive(Debug, PartialEq)]
    enum ClientFailure {
        Down,
        Refused,
        Open,
    }

    impl From<CircuitOpenError> for ClientFailure {
        fn from(_: CircuitOpenError) -> Self {
            Self::Open
        }
    }
}
