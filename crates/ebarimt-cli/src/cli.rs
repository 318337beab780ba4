//! CLI argument definitions for ebarimt.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `submit` | Submit a receipt, queueing it when the API is unreachable |
//! | `drain` | Process one batch of the offline queue |
//! | `worker` | Drain periodically until interrupted |
//! | `queue-status` | Offline queue counts per status |
//! | `retry-failed` | Reset failed queue items to pending |
//! | `reset-breaker` | Force a circuit breaker closed |
//! | `health` | Liveness, readiness or detailed health |
//! | `sync-reference` | Refresh district and tax codes |
//! | `metrics` | Metrics summary |
//! | `receipt-log` | Recent submission outcomes and totals |
//! | `config` | Show configuration issues |
//!
//! # Examples
//!
//! ```bash
//! # Submit a receipt payload from a file
//! ebarimt submit SINV-0001 --modified "2024-05-01 10:00:00" --payload receipt.json
//!
//! # Drain the offline queue against a scripted API
//! ebarimt --mock drain --pretty
//!
//! # Detailed health as JSON
//! ebarimt health --detailed --pretty
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ebarimt_core::Service;

#[derive(Debug, Parser)]
#[command(
    name = "ebarimt",
    author,
    version,
    about = "Resilient eBarimt receipt submission",
    long_about = "Submits receipts to the eBarimt POS API through a circuit breaker, \
rate limiter and retry, deduplicates per document version, and parks receipts in an \
offline queue while the API is unreachable.\n\
\n\
Configuration is read from EBARIMT_* environment variables.\n\
\n\
Use 'ebarimt <command> --help' for command-specific help."
)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Answer every API call with a scripted successful response.
    #[arg(long, global = true, default_value_t = false)]
    pub mock: bool,

    /// Keep queue, cache and logs in memory instead of the DuckDB store.
    #[arg(long, global = true, default_value_t = false)]
    pub no_store: bool,

    /// Data directory; overrides EBARIMT_HOME.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    /// Roles of the caller, checked by operator commands.
    #[arg(long = "role", global = true, default_values_t = [String::from("System Manager")])]
    pub roles: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceArg {
    Pos,
    PublicApi,
    Itc,
}

impl From<ServiceArg> for Service {
    fn from(value: ServiceArg) -> Self {
        match value {
            ServiceArg::Pos => Self::Pos,
            ServiceArg::PublicApi => Self::PublicApi,
            ServiceArg::Itc => Self::Itc,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a receipt for one version of a source document.
    ///
    /// A version already submitted returns the earlier receipt. When the
    /// API cannot be reached the receipt is queued and the queue id returned.
    ///
    /// # Examples
    ///
    ///   ebarimt submit SINV-0001 --modified "2024-05-01 10:00:00" --payload receipt.json
    ///   cat receipt.json | ebarimt submit SINV-0001 --modified 3 --payload -
    Submit(SubmitArgs),

    /// Process one batch of pending queue items.
    Drain(DrainArgs),

    /// Drain the queue periodically and sync reference data daily until Ctrl-C.
    Worker,

    /// Offline queue counts per status.
    QueueStatus,

    /// Reset failed queue items to pending with a fresh retry budget.
    RetryFailed,

    /// Force a circuit breaker closed.
    ResetBreaker(ResetBreakerArgs),

    /// Liveness, readiness or detailed health.
    Health(HealthArgs),

    /// Refresh district and tax codes from the public API.
    SyncReference,

    /// Counters, gauges and latency percentiles.
    Metrics,

    /// Recent submission outcomes and totals from the receipt log.
    ReceiptLog(ReceiptLogArgs),

    /// Validate the resolved configuration.
    Config,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Source document name.
    pub name: String,

    /// Source document type.
    #[arg(long, default_value = "Sales Invoice")]
    pub doctype: String,

    /// Source document modification stamp.
    #[arg(long)]
    pub modified: String,

    /// Receipt payload JSON file, or `-` for stdin.
    #[arg(long)]
    pub payload: PathBuf,

    /// Queue priority, 1 most urgent to 10 least.
    #[arg(long, value_parser = clap::value_parser!(i32).range(1..=10))]
    pub priority: Option<i32>,
}

#[derive(Debug, Args)]
pub struct DrainArgs {
    /// Items per pass; defaults to the configured batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ReceiptLogArgs {
    /// Number of entries to show.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct ResetBreakerArgs {
    #[arg(value_enum, default_value_t = ServiceArg::Pos)]
    pub service: ServiceArg,
}

#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Run every dependency check.
    #[arg(long, conflicts_with_all = ["ready", "live"])]
    pub detailed: bool,

    /// Readiness check.
    #[arg(long, conflicts_with = "live")]
    pub ready: bool,

    /// Liveness check.
    #[arg(long)]
    pub live: bool,
}
