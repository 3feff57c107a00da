//! Churnflow CLI - Main entry point

use churnflow_cli::{commands, Cli, Commands};
use churnflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use clap::Parser;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("churnflow")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // File output is flushed when the guard drops
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    let result = match cli.command {
        Commands::Run {
            source,
            dry_run,
            job_name,
        } => commands::run(source, dry_run, job_name).await,
        Commands::Reset { yes } => commands::reset(yes).await.map(|()| true),
        Commands::Jobs { limit } => commands::jobs(limit).await.map(|()| true),
    };

    let code = match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            2
        },
    };

    drop(guard);
    process::exit(code);
}
