use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::constants::{
    ENV_CLAIM_TIMEOUT_SECS, ENV_CONFIG, ENV_DATA_DIR, ENV_RUN_ID, ENV_STORAGE_ROOT,
};

#[derive(Parser)]
#[command(name = "vivarium")]
#[command(version, about = "Artificial-life simulation data pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Data directory (database + default blob root)
    #[arg(long, global = true, env = ENV_DATA_DIR)]
    pub data_dir: Option<String>,

    /// Blob-store root directory (overrides storage.rootDirectory)
    #[arg(long, global = true, env = ENV_STORAGE_ROOT)]
    pub storage_root: Option<String>,

    /// Index an existing run instead of discovering a live one
    #[arg(long, global = true, env = ENV_RUN_ID)]
    pub run_id: Option<String>,

    /// Claim timeout in seconds; 0 disables stuck-claim reassignment
    #[arg(long, global = true, env = ENV_CLAIM_TIMEOUT_SECS)]
    pub claim_timeout_secs: Option<u64>,

    /// Run indexers only (no persistence service)
    #[arg(long, global = true)]
    pub no_persistence: bool,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Commands {
    /// Start the pipeline (default)
    Run,
    /// Resolve and print the effective configuration, then exit
    CheckConfig,
}

/// CLI values relevant to config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub data_dir: Option<String>,
    pub storage_root: Option<String>,
    pub run_id: Option<String>,
    pub claim_timeout_secs: Option<u64>,
    pub no_persistence: bool,
}

/// Parse the process arguments.
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    (
        CliConfig {
            config: cli.config,
            data_dir: cli.data_dir,
            storage_root: cli.storage_root,
            run_id: cli.run_id,
            claim_timeout_secs: cli.claim_timeout_secs,
            no_persistence: cli.no_persistence,
        },
        cli.command,
    )
}
