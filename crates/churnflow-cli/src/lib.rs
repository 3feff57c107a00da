//! Churnflow command-line interface
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Churnflow - customer churn ETL pipeline
#[derive(Parser, Debug)]
#[command(name = "churnflow")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline over a customer extract
    Run {
        /// Path to the source CSV
        #[arg(short, long, env = "ETL_SOURCE_PATH")]
        source: PathBuf,

        /// Extract, transform and validate without writing to either store
        #[arg(long)]
        dry_run: bool,

        /// Job name recorded on the run (overrides ETL_JOB_NAME)
        #[arg(long)]
        job_name: Option<String>,
    },

    /// Drop and recreate every primary-store table
    Reset {
        /// Confirm that all loaded data and job history will be discarded
        #[arg(long)]
        yes: bool,
    },

    /// List recent job runs
    Jobs {
        /// Number of runs to show
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },
}
