//! CLI argument definitions using clap
//!
//! Commands:
//! - westore serve --config <path>
//! - westore check --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// westore - model-driven REST API over document stores
#[derive(Parser, Debug)]
#[command(name = "westore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect datasources, resolve models and serve the REST API
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./westore.json")]
        config: PathBuf,
    },

    /// Load and resolve models without serving, then list them
    Check {
        /// Path to configuration file
        #[arg(long, default_value = "./westore.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
