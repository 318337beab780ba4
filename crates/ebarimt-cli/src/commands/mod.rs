mod operations;
mod queue;
mod reference;
mod submit;
mod worker;

use std::sync::Arc;

use ebarimt_core::{
    EbarimtConfig, HttpResponse, MemoryDocumentStore, ResilientClient, ScriptedHttpClient, Store,
    StoreConfig,
};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Answers every scripted call: a successful receipt plus a token grant.
const MOCK_RESPONSE: &str = r#"{"status":"SUCCESS","id":"MOCK-0000000000000001","lottery":"AA 00000001","qrData":"MOCK-QR","access_token":"mock-token","expires_in":300}"#;

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
    pub exit_code: u8,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
            exit_code: 0,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_exit_code(mut self, exit_code: u8) -> Self {
        self.exit_code = exit_code;
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    let config = resolve_config(cli)?;

    // Config inspection must work even when the store cannot be opened.
    if matches!(cli.command, Command::Config) {
        return Ok(operations::config(&config));
    }

    let client = build_client(cli, config)?;
    let documents = MemoryDocumentStore::new();

    match &cli.command {
        Command::Submit(args) => submit::run(args, &client, &documents).await,
        Command::Drain(args) => queue::drain(args, &client, &documents).await,
        Command::Worker => worker::run(&client, &documents).await,
        Command::QueueStatus => queue::status(&client, &cli.roles).await,
        Command::RetryFailed => queue::retry_failed(&client, &cli.roles).await,
        Command::ResetBreaker(args) => {
            operations::reset_breaker(args, &client, &cli.roles).await
        }
        Command::Health(args) => operations::health(args, &client).await,
        Command::SyncReference => reference::run(&client).await,
        Command::Metrics => operations::metrics(&client, &cli.roles).await,
        Command::ReceiptLog(args) => operations::receipt_log(args, &client, &cli.roles).await,
        Command::Config => Ok(operations::config(client.config())),
    }
}

fn resolve_config(cli: &Cli) -> Result<EbarimtConfig, CliError> {
    let mut config = EbarimtConfig::from_env()?;
    if let Some(home) = &cli.home {
        config.store = StoreConfig::in_dir(home);
    }
    Ok(config)
}

fn build_client(cli: &Cli, config: EbarimtConfig) -> Result<ResilientClient, CliError> {
    let store = if cli.no_store {
        None
    } else {
        Some(Store::open(config.store.clone())?)
    };

    let mut builder = ResilientClient::builder(config);
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    if cli.mock {
        builder = builder.with_http_client(Arc::new(ScriptedHttpClient::new(Ok(
            HttpResponse::ok_json(MOCK_RESPONSE),
        ))));
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["ebarimt", "--no-store", "--mock"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[tokio::test]
    async fn mock_submission_is_accepted_then_deduplicated() {
        let cli = cli(&["queue-status"]);
        let client = build_client(&cli, EbarimtConfig::default()).expect("client builds");
        let documents = MemoryDocumentStore::new();
        let payload = json!({ "billType": "B2C_RECEIPT", "totalAmount": 1000.0 });
        let args = crate::cli::SubmitArgs {
            name: "SINV-0001".to_owned(),
            doctype: "Sales Invoice".to_owned(),
            modified: "2024-05-01 10:00:00".to_owned(),
            payload: "unused.json".into(),
            priority: None,
        };

        let first = submit::submit_payload(&args, payload.clone(), &client, &documents)
            .await
            .expect("first submission succeeds");
        assert_eq!(first.data["outcome"], "submitted");

        let second = submit::submit_payload(&args, payload, &client, &documents)
            .await
            .expect("second submission succeeds");
        assert_eq!(second.data["outcome"], "duplicate");
        assert_eq!(second.data["id"], "MOCK-0000000000000001");
    }

    #[tokio::test]
    async fn operator_commands_require_a_privileged_role() {
        let cli = Cli::parse_from(["ebarimt", "--no-store", "--role", "Accounts User", "queue-status"]);
        let client = build_client(&cli, EbarimtConfig::default()).expect("client builds");

        let error = queue::status(&client, &cli.roles)
            .await
            .err()
            .expect("permission denied");
        assert_eq!(error.exit_code(), 7);
    }
}
