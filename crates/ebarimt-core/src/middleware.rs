//! Interceptor chain wrapped around an outbound API call.
//!
//! Interceptors run in list order; the last one hands off to the transport.
//! The resilient client composes them as breaker, then limiter, then retry,
//! with idempotency handled above the chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::ClientError;
use crate::http_client::HttpResponse;
use crate::rate_limiter::RateLimiter;
use crate::retry::{retry_with_backoff, RetryConfig};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type CallResult = Result<HttpResponse, ClientError>;

/// The innermost call. Invoked once per attempt, so retries re-run it.
pub type Transport<'a> = dyn Fn() -> BoxFuture<'a, CallResult> + Send + Sync + 'a;

/// Box an attempt future so it can be returned from a [`Transport`] closure.
pub fn boxed<'a, F>(future: F) -> BoxFuture<'a, CallResult>
where
    F: Future<Output = CallResult> + Send + 'a,
{
    Box::pin(future)
}

/// Remainder of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    transport: &'a Transport<'a>,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Interceptor>], transport: &'a Transport<'a>) -> Self {
        Self { chain, transport }
    }

    pub fn run(self) -> BoxFuture<'a, CallResult> {
        match self.chain.split_first() {
            Some((head, rest)) => head.intercept(Next {
                chain: rest,
                transport: self.transport,
            }),
            None => (self.transport)(),
        }
    }
}

/// One cross-cutting wrapper around the transport call.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept<'a>(&'a self, next: Next<'a>) -> BoxFuture<'a, CallResult>;
}

/// Ordered interceptor list.
#[derive(Clone, Default)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors
            .iter()
            .map(|interceptor| interceptor.name())
            .collect()
    }

    pub fn execute<'a>(&'a self, transport: &'a Transport<'a>) -> BoxFuture<'a, CallResult> {
        Next::new(&self.interceptors, transport).run()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("interceptors", &self.names())
            .finish()
    }
}

/// Fails fast while the breaker is open. Only transient failures count
/// toward opening it. A refusal from the API settles a recovery call.
pub struct CircuitBreakerInterceptor {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerInterceptor {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl Interceptor for CircuitBreakerInterceptor {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn intercept<'a>(&'a self, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            self.breaker
                .call_with(|| next.run(), ClientError::breaker_verdict)
                .await
        })
    }
}

/// Waits for a token, up to `timeout`.
pub struct RateLimitInterceptor {
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl RateLimitInterceptor {
    pub fn new(limiter: Arc<RateLimiter>, timeout: Duration) -> Self {
        Self { limiter, timeout }
    }
}

impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    fn intercept<'a>(&'a self, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            self.limiter.acquire(true, self.timeout).await?;
            next.run().await
        })
    }
}

/// Re-runs the rest of the chain on retryable failures.
pub struct RetryInterceptor {
    config: RetryConfig,
}

impl RetryInterceptor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl Interceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn intercept<'a>(&'a self, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            retry_with_backoff(
                &self.config,
                || next.run(),
                |error| self.config.should_retry(error),
                |error, attempt| {
                    tracing::warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %error,
                        "retrying eBarimt call"
                    );
                },
            )
            .await
        })
    }
}
