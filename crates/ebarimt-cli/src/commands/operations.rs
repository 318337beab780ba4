use ebarimt_core::health::{self, CheckStatus};
use ebarimt_core::{operator, EbarimtConfig, ResilientClient};
use serde_json::json;

use crate::cli::{HealthArgs, ReceiptLogArgs, ResetBreakerArgs};
use crate::commands::CommandResult;
use crate::error::CliError;

pub async fn reset_breaker(
    args: &ResetBreakerArgs,
    client: &ResilientClient,
    roles: &[String],
) -> Result<CommandResult, CliError> {
    let data = operator::reset_circuit_breaker(client, roles, args.service.into()).await?;
    Ok(CommandResult::ok(data))
}

pub async fn metrics(client: &ResilientClient, roles: &[String]) -> Result<CommandResult, CliError> {
    let data = operator::metrics_summary(client, roles).await?;
    Ok(CommandResult::ok(data))
}

pub async fn receipt_log(
    args: &ReceiptLogArgs,
    client: &ResilientClient,
    roles: &[String],
) -> Result<CommandResult, CliError> {
    let data = operator::receipt_log(client, roles, args.limit).await?;
    Ok(CommandResult::ok(data))
}

/// Exit code 1 when not ready or unhealthy, so orchestrators can gate on it.
pub async fn health(args: &HealthArgs, client: &ResilientClient) -> Result<CommandResult, CliError> {
    if args.ready {
        let readiness = health::readiness(client).await;
        let exit_code = u8::from(!readiness.ready);
        return Ok(CommandResult::ok(serde_json::to_value(readiness)?).with_exit_code(exit_code));
    }

    if args.detailed {
        let report = health::detailed_health(client).await;
        let warnings = report
            .checks
            .iter()
            .filter(|(_, check)| !check.status.is_ok())
            .map(|(name, check)| format!("{name} check is {}", check.status.as_str()))
            .collect();
        let exit_code = u8::from(report.status == CheckStatus::Unhealthy);
        return Ok(CommandResult::ok(serde_json::to_value(report)?)
            .with_warnings(warnings)
            .with_exit_code(exit_code));
    }

    if args.live {
        return Ok(CommandResult::ok(health::liveness()));
    }

    Ok(CommandResult::ok(health::health()))
}

pub fn config(config: &EbarimtConfig) -> CommandResult {
    let report = config.validate();
    report.log();

    let warnings = report
        .warnings()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect();
    let exit_code = if report.is_valid() { 0 } else { 2 };
    CommandResult::ok(json!({
        "enabled": config.enabled,
        "environment": config.api.environment.as_str(),
        "pos_url": config.api.pos.primary,
        "fallback_urls": config.api.pos.fallbacks,
        "credentials": config.api.credentials().is_some(),
        "db_path": config.store.db_path,
        "valid": report.is_valid(),
        "issues": report.issues,
    }))
    .with_warnings(warnings)
    .with_exit_code(exit_code)
}
