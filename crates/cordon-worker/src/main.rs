//! cordon-worker - runs one sandboxed execution.
//!
//! Reads a request line on stdin, speaks the worker protocol on stdout and
//! logs to stderr. Hosts with their own capabilities or roots ship a binary
//! like this one that passes custom catalogs to `worker_main`.

use anyhow::Result;
use clap::Parser;
use tracing::Level;

use cordon_core::telemetry::init_worker_tracing;
use cordon_core::{worker_main, WorkerCatalogs};

#[derive(Parser)]
#[command(name = "cordon-worker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Worker process for the cordon sandbox", long_about = None)]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "CORDON_WORKER_LOG", default_value = "warn")]
    log_level: Level,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    log_json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_worker_tracing(cli.log_json, cli.log_level);
    worker_main(WorkerCatalogs::builtin())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["cordon-worker"]);
        assert_eq!(cli.log_level, Level::WARN);
        assert!(!cli.log_json);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["cordon-worker", "--log-level", "debug", "--log-json"]);
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(cli.log_json);
    }
}
