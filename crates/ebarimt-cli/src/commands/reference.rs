use ebarimt_core::{reference_data, ResilientClient};

use crate::commands::CommandResult;
use crate::error::CliError;

pub async fn run(client: &ResilientClient) -> Result<CommandResult, CliError> {
    let report = reference_data::sync_reference_data(client).await?;
    let mut result = CommandResult::ok(serde_json::to_value(report)?);
    if report.districts.inserted + report.districts.updated == 0 {
        result = result.with_warning("public API returned no district codes");
    }
    if report.tax_codes.inserted + report.tax_codes.updated == 0 {
        result = result.with_warning("public API returned no tax codes");
    }
    Ok(result)
}
