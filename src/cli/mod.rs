//! CLI module for westore
//!
//! Provides command-line interface for:
//! - serve: Boot datasources and models, then serve the REST API
//! - check: Resolve models and print them

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{boot, check, model_summary, run_command, serve};
pub use errors::{CliError, CliErrorCode, CliResult};
