use std::io::Read;

use ebarimt_core::{
    DocumentStore, MemoryDocumentStore, ReceiptSubmission, ResilientClient, SourceReference, SubmissionOutcome,
};
use serde_json::Value;

use crate::cli::SubmitArgs;
use crate::commands::CommandResult;
use crate::error::CliError;

pub async fn run(
    args: &SubmitArgs,
    client: &ResilientClient,
    documents: &MemoryDocumentStore,
) -> Result<CommandResult, CliError> {
    let payload = read_payload(args)?;
    submit_payload(args, payload, client, documents).await
}

pub(super) async fn submit_payload(
    args: &SubmitArgs,
    payload: Value,
    client: &ResilientClient,
    documents: &MemoryDocumentStore,
) -> Result<CommandResult, CliError> {
    if !payload.is_object() {
        return Err(CliError::Command(
            "receipt payload must be a JSON object".to_owned(),
        ));
    }

    let source = SourceReference::new(&args.doctype, &args.name);
    let mut submission = ReceiptSubmission::new(source.clone(), &args.modified, payload);
    if let Some(priority) = args.priority {
        submission = submission.with_priority(priority);
    }

    let outcome = client.submit_receipt(submission).await?;
    let data = serde_json::to_value(&outcome)?;
    let result = CommandResult::ok(data);

    Ok(match outcome {
        SubmissionOutcome::Queued { .. } => result.with_warning(format!(
            "{} {} was queued; run `ebarimt drain` once the API is reachable",
            source.doctype, source.name
        )),
        SubmissionOutcome::Duplicate(_) => {
            result.with_warning("this document version was already submitted")
        }
        SubmissionOutcome::Submitted(receipt) => {
            match documents.apply_receipt(&source, &receipt).await {
                Ok(()) => result,
                Err(error) => result.with_warning(format!("receipt not written back: {error}")),
            }
        }
    })
}

fn read_payload(args: &SubmitArgs) -> Result<Value, CliError> {
    let raw = if args.payload.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(&args.payload)?
    };
    Ok(serde_json::from_str(&raw)?)
}
