//! westore CLI entry point
//!
//! Parses arguments, installs the log subscriber and hands off to the
//! CLI module. Errors go to stderr with a non-zero exit.

use tracing_subscriber::EnvFilter;

use westore::cli::{self, Cli};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let args = Cli::parse_args();
    init_tracing(args.log_json);

    if let Err(e) = cli::run_command(args.command) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
