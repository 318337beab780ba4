mod cli;
mod commands;
mod error;

use clap::Parser;
use serde_json::json;
use std::process::ExitCode;

use ebarimt_core::logging::{self, LogFormat};

use crate::cli::{Cli, LogFormatArg};
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    logging::init_logging(match cli.log_format {
        LogFormatArg::Text => LogFormat::Text,
        LogFormatArg::Json => LogFormat::Json,
    });

    let result = commands::run(&cli).await?;
    let output = json!({ "data": result.data, "warnings": result.warnings });
    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");

    Ok(ExitCode::from(result.exit_code))
}
