use ebarimt_core::{operator, MemoryDocumentStore, ResilientClient};

use crate::cli::DrainArgs;
use crate::commands::CommandResult;
use crate::error::CliError;

pub async fn drain(
    args: &DrainArgs,
    client: &ResilientClient,
    documents: &MemoryDocumentStore,
) -> Result<CommandResult, CliError> {
    let report = match args.batch_size {
        Some(0) => {
            return Err(CliError::Command(
                "batch size must be greater than zero".to_owned(),
            ))
        }
        Some(batch_size) => {
            let report = client
                .queue()
                .process_queue(batch_size, client, documents)
                .await?;
            client.record_queue_size().await;
            report
        }
        None => client.drain_queue(documents).await?,
    };

    let mut warnings = Vec::new();
    if let Some(reason) = &report.reason {
        warnings.push(format!("drain skipped: {reason}"));
    }
    if report.failed > 0 {
        warnings.push(format!("{} item(s) failed and stay queued", report.failed));
    }
    Ok(CommandResult::ok(serde_json::to_value(report)?).with_warnings(warnings))
}

pub async fn status(client: &ResilientClient, roles: &[String]) -> Result<CommandResult, CliError> {
    let data = operator::queue_status(client, roles).await?;
    Ok(CommandResult::ok(data))
}

pub async fn retry_failed(
    client: &ResilientClient,
    roles: &[String],
) -> Result<CommandResult, CliError> {
    let data = operator::retry_failed_items(client, roles).await?;
    client.record_queue_size().await;
    Ok(CommandResult::ok(data))
}
