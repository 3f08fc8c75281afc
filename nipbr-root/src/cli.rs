use clap::Parser;

use std::path::PathBuf;

use nipbr_lib::{config, logging};

/// Policy based routing service for network instance bridges
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Configuration file, watched for changes
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH
    )]
    pub config_path: PathBuf,

    /// Write logs to this file instead of stdout; reopened on SIGHUP
    #[arg(long, env = logging::ENV_VAR_LOG_FILE)]
    pub log_file: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
