//! railstack CLI: typed deployment topology synthesized to CloudFormation.

use clap::Parser;
use railstack::cli::Cli;
use tracing_subscriber::EnvFilter;

/// Diagnostics go to stderr; `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "warn",
        1 => "railstack=info",
        2 => "railstack=debug",
        _ => "railstack=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = railstack::cli::dispatch(cli.command) {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}
