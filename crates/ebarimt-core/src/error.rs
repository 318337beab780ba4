use ebarimt_store::StoreError;
use thiserror::Error;

use crate::circuit_breaker::{CircuitOpenError, ErrorVerdict};
use crate::http_client::{HttpError, HttpErrorKind};
use crate::rate_limiter::RateLimitExceeded;

/// Failures of the shared key/value cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cached value is not valid json: {0}")]
    Serialization(String),
}

impl From<StoreError> for CacheError {
    fn from(error: StoreError) -> Self {
        Self::Unavailable(error.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Errors surfaced by calls to the eBarimt APIs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error(transparent)]
    Transport(#[from] HttpError),

    #[error("eBarimt API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("receipt could not be submitted or queued: {0}")]
    QueueUnavailable(String),
}

impl ClientError {
    /// Timeouts, connection failures, 5xx and 429 responses.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(error) => error.retryable(),
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// How this error counts toward the circuit breaker of the service.
    pub const fn breaker_verdict(&self) -> ErrorVerdict {
        if self.is_transient() {
            return ErrorVerdict::Failure;
        }
        match self {
            Self::Api { .. } | Self::Auth(_) | Self::InvalidResponse(_) => ErrorVerdict::Answered,
            Self::CircuitOpen(_)
            | Self::RateLimited(_)
            | Self::Transport(_)
            | Self::QueueUnavailable(_) => ErrorVerdict::NotSent,
        }
    }

    /// Failures that turn a receipt submission into a queued item instead of an error.
    pub const fn is_queueable(&self) -> bool {
        self.is_transient() || matches!(self, Self::CircuitOpen(_) | Self::RateLimited(_))
    }

    /// Metrics category for this failure.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Transport(error) => match error.kind() {
                HttpErrorKind::Timeout => "timeout",
                HttpErrorKind::Connect => "connection_error",
                HttpErrorKind::Other => "unknown",
            },
            Self::Api { status: 429, .. } | Self::RateLimited(_) => "rate_limited",
            Self::Api { status: 503, .. } => "service_unavailable",
            Self::Api { status, .. } if *status >= 500 => "server_error",
            Self::Api { .. } => "client_error",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Auth(_) => "auth_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::QueueUnavailable(_) => "queue_unavailable",
        }
    }
}

/// Offline queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("queue item '{0}' not found")]
    NotFound(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Reference data synchronization failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("reference data sync needs the durable store")]
    StoreUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn api(status: u16) -> ClientError {
        ClientError::Api {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(api(500).is_transient());
        assert!(api(503).is_transient());
        assert!(api(429).is_transient());
        assert!(!api(400).is_transient());
        assert!(!api(404).is_transient());
        assert!(ClientError::Transport(HttpError::timeout("slow")).is_transient());
        assert!(!ClientError::Transport(HttpError::other("tls")).is_transient());
    }

    #[test]
    fn open_circuit_is_queueable_but_not_transient() {
        let error = ClientError::from(CircuitOpenError {
            name: "pos".to_string(),
            recovery_timeout: Duration::from_secs(30),
        });
        assert!(!error.is_transient());
        assert!(error.is_queueable());
        assert!(!api(422).is_queueable());
    }

    #[test]
    fn only_outages_count_as_breaker_failures() {
        assert_eq!(api(503).breaker_verdict(), ErrorVerdict::Failure);
        assert_eq!(
            ClientError::Transport(HttpError::timeout("slow")).breaker_verdict(),
            ErrorVerdict::Failure
        );
        assert_eq!(api(400).breaker_verdict(), ErrorVerdict::Answered);
        assert_eq!(
            ClientError::InvalidResponse("status ERROR".to_string()).breaker_verdict(),
            ErrorVerdict::Answered
        );
        assert_eq!(
            ClientError::Transport(HttpError::other("tls")).breaker_verdict(),
            ErrorVerdict::NotSent
        );
    }

    #[test]
    fn categories_follow_status_codes() {
        assert_eq!(api(503).category(), "service_unavailable");
        assert_eq!(api(502).category(), "server_error");
        assert_eq!(api(429).category(), "rate_limited");
        assert_eq!(api(400).category(), "client_error");
        assert_eq!(
            ClientError::Transport(HttpError::connect("refused")).category(),
            "connection_error"
        );
    }
}
