use ebarimt_core::{tasks, MemoryDocumentStore, ResilientClient};
use serde_json::json;

use crate::commands::CommandResult;
use crate::error::CliError;

pub async fn run(
    client: &ResilientClient,
    documents: &MemoryDocumentStore,
) -> Result<CommandResult, CliError> {
    tasks::run_worker(client, documents, async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "ctrl-c handler unavailable, stopping worker");
        }
    })
    .await;

    let pending = client.record_queue_size().await;
    Ok(CommandResult::ok(json!({ "stopped": true, "pending": pending })))
}
