//! # Structured Logging
//!
//! Process-wide `tracing` setup plus helpers that emit the standard API-call
//! and receipt-event records. Log output is controlled by `EBARIMT_LOG`
//! (an `EnvFilter` directive, default `info`).

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

pub const LOG_ENV: &str = "EBARIMT_LOG";

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Initialize the global subscriber once. Later calls are no-ops, and an
/// already installed subscriber is left in place.
pub fn init_logging(format: LogFormat) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let layer = match format {
            LogFormat::Text => fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr)
                .boxed(),
        };

        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}

/// Short id tying together the log lines of one call or drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(12);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One outbound API call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiCallRecord<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    /// Request and response bodies; logged only with `debug_payloads`.
    pub request: Option<&'a str>,
    pub response: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Log an API call at `info`, or `error` when it failed.
pub fn api_call(record: &ApiCallRecord<'_>, debug_payloads: bool) {
    let request = record.request.filter(|_| debug_payloads);
    let response = record.response.filter(|_| debug_payloads);
    if let Some(error) = record.error {
        tracing::error!(
            method = record.method,
            url = record.url,
            status_code = record.status_code,
            duration_ms = record.duration_ms,
            request,
            response,
            error,
            "API_CALL"
        );
    } else {
        tracing::info!(
            method = record.method,
            url = record.url,
            status_code = record.status_code,
            duration_ms = record.duration_ms,
            request,
            response,
            "API_CALL"
        );
    }
}

/// Lifecycle event of one receipt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiptEvent<'a> {
    pub event: &'a str,
    pub invoice: &'a str,
    pub receipt_id: Option<&'a str>,
    pub lottery: Option<&'a str>,
    pub amount: Option<f64>,
    pub bill_type: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Log a receipt event at `info`, or `error` when it carries an error.
pub fn receipt_event(event: &ReceiptEvent<'_>) {
    if let Some(error) = event.error {
        tracing::error!(
            event = event.event,
            invoice = event.invoice,
            receipt_id = event.receipt_id,
            lottery = event.lottery,
            amount = event.amount,
            bill_type = event.bill_type,
            error,
            "RECEIPT_EVENT"
        );
    } else {
        tracing::info!(
            event = event.event,
            invoice = event.invoice,
            receipt_id = event.receipt_id,
            lottery = event.lottery,
            amount = event.amount,
            bill_type = event.bill_type,
            "RECEIPT_EVENT"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_short_and_unique() {
        let first = CorrelationId::new();
        let second = CorrelationId::new();
        assert_eq!(first.as_str().len(), 12);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn log_format_parses_names() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("Text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(LogFormat::Text);
        init_logging(LogFormat::Json);
        api_call(
            &ApiCallRecord {
                method: "POST",
                url: "https://api.frappe.mn/test/rest/receipt",
                status_code: Some(200),
                duration_ms: 42,
                ..ApiCallRecord::default()
            },
            false,
        );
        receipt_event(&ReceiptEvent {
            event: "created",
            invoice: "SINV-0001",
            ..ReceiptEvent::default()
        });
    }
}
