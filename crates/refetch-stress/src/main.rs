use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use refetch::config::Config;

use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Runs synthetic event streams through fetch operators and reports their throughput.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Install a JSON log subscriber writing into the void instead of the configured logger.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local statsd sink that discards everything.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            refetch::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads = WorkloadsConfig::from_reader(workloads_file)?;
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // logging has to be set up before the runtime spawns its threads
    let mut guard = logging::init(
        &config,
        logging::Options {
            tracing: cli.tracing,
            metrics: cli.metrics,
        },
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let udp_sink = guard.udp_sink.take();
    runtime.block_on(async move {
        if let Some(udp_sink) = udp_sink {
            tokio::spawn(udp_sink);
        }
        stresstest::perform_stresstest(config.fetch, workloads, cli.duration).await
    })
}
