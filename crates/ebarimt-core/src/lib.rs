//! # eBarimt Core
//!
//! Resilient submission of receipts to the Mongolian eBarimt VAT system.
//!
//! ## Overview
//!
//! - **Circuit breaker** shared across processes through the cache
//! - **Token bucket rate limiter** per service
//! - **Retry with backoff** for transient failures
//! - **Idempotency** so a document version is submitted once
//! - **Offline queue** holding receipts while the API is unreachable
//! - **Resilient client** composing all of the above
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`auth`] | OAuth2 tokens for the ITC services |
//! | [`cache`] | Shared key/value cache with TTL |
//! | [`circuit_breaker`] | Cache-backed circuit breaker |
//! | [`client`] | The resilient client |
//! | [`config`] | Configuration and validation |
//! | [`documents`] | Receipt write-back to source documents |
//! | [`endpoints`] | Primary and fallback base URLs per service |
//! | [`error`] | Error types |
//! | [`health`] | Liveness, readiness and detailed health |
//! | [`http_client`] | HTTP client abstraction |
//! | [`idempotency`] | Result deduplication |
//! | [`logging`] | Tracing setup and structured events |
//! | [`metrics`] | Cache-backed counters, gauges and timings |
//! | [`middleware`] | Interceptor chain |
//! | [`offline_queue`] | Offline receipt queue |
//! | [`operator`] | Role-gated operator actions |
//! | [`rate_limiter`] | Token bucket |
//! | [`receipt`] | Receipt submission types |
//! | [`reference_data`] | District and tax code sync |
//! | [`retry`] | Retry policy and backoff |
//! | [`tasks`] | Scheduled jobs |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ submit_receipt   │──── idempotency hit ───▶ earlier receipt
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐   ┌──────────────┐   ┌───────┐
//! │ Circuit Breaker  │──▶│ Rate Limiter │──▶│ Retry │
//! └──────────────────┘   └──────────────┘   └───┬───┘
//!                                               ▼
//!                                  ┌──────────────────────┐
//!                                  │ primary → fallbacks  │
//!                                  └──────────┬───────────┘
//!                      unreachable ───────────┘
//!                          ▼
//!                 ┌──────────────────┐
//!                 │  Offline Queue   │◀── periodic drain
//!                 └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ebarimt_core::{EbarimtConfig, ReceiptSubmission, ResilientClient, SourceReference};
//!
//! let client = ResilientClient::builder(EbarimtConfig::from_env()?).build();
//! let outcome = client
//!     .submit_receipt(ReceiptSubmission::new(
//!         SourceReference::new("Sales Invoice", "SINV-0001"),
//!         "2024-05-01 10:00:00",
//!         payload,
//!     ))
//!     .await?;
//! ```

pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod documents;
pub mod endpoints;
pub mod error;
pub mod health;
pub mod http_client;
pub mod idempotency;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod offline_queue;
pub mod operator;
pub mod rate_limiter;
pub mod receipt;
pub mod reference_data;
pub mod retry;
pub mod tasks;
pub mod timestamp;

// Cache
pub use cache::{Cache, MemoryCache, StoreCache};

// Circuit breaker
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState, ErrorVerdict,
};

// Client
pub use client::{ResilientClient, ResilientClientBuilder, QUEUED_MESSAGE};

// Configuration
pub use config::{ConfigError, ConfigReport, EbarimtConfig, Environment};

// Documents
pub use documents::{DocumentStore, MemoryDocumentStore};

// Endpoints
pub use endpoints::{ApiCall, EndpointTransport, Service};

// Error types
pub use error::{CacheError, ClientError, QueueError, SyncError};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};

// Idempotency
pub use idempotency::{IdempotencyManager, IdempotencyRecord};

// Metrics
pub use metrics::MetricsCollector;

// Middleware
pub use middleware::{Interceptor, Pipeline};

// Offline queue
pub use offline_queue::{OfflineQueue, ProcessReport, QueueItem, QueueStats, QueueStatus, SourceReference};

// Rate limiting
pub use rate_limiter::{RateLimitExceeded, RateLimiter, RateLimiterConfig};

// Receipts
pub use receipt::{BillType, ReceiptResponse, ReceiptSubmission, SubmissionOutcome};

// Retry logic
pub use retry::{retry_with_backoff, Backoff, RetryConfig};

// Time
pub use timestamp::UtcDateTime;

// Store (re-exported from ebarimt-store)
pub use ebarimt_store::{Store, StoreConfig, StoreError};
