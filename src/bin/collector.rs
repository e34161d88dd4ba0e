//! CLI entry point: logging bootstrap + config load + worker orchestration.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use onefs_stats_collector::config::GlobalConfig;
use onefs_stats_collector::run::{run_all_clusters, run_once};
use onefs_stats_collector::sink::NullSink;

#[derive(Parser, Debug)]
#[command(name = "onefs-stats-collector", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "OSC_CONFIG")]
    config: String,

    /// Log level filter (overridden by RUST_LOG if set).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a single connect + metadata-fetch pass per cluster, then exit.
    #[arg(long)]
    once: bool,
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let raw = match fs::read_to_string(&args.config) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %args.config, error = %e, "failed to read config file");
            return std::process::ExitCode::FAILURE;
        }
    };

    let config = match GlobalConfig::from_toml_str(&raw) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    // TODO: real sink selection (TSDB/Prometheus) is out of this core's scope.
    let sink = Arc::new(NullSink);

    if args.once {
        run_once(config, sink).await;
        return std::process::ExitCode::SUCCESS;
    }

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_for_signal.cancel();
    });

    run_all_clusters(config, sink, shutdown).await;
    std::process::ExitCode::SUCCESS
}
