use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;

use netprobe::config::{AppConfig, ConfigBuilder, ENV_PREFIX, LogLevel};
use netprobe::error::AgentError;
use netprobe::pipeline::{Pipeline, ShutdownReport};
use netprobe::util::logging;

/// Exit code when records were left undelivered
const EXIT_UNDELIVERED: u8 = 1;
/// Exit code for configuration errors
const EXIT_CONFIG: u8 = 2;

/// Continuously probe network targets and export windowed summaries
#[derive(Debug, Parser)]
#[command(name = "netprobe", version, about)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, env = "NETPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Base URL of the Elasticsearch-compatible sink
    #[arg(long, value_name = "URL")]
    elastic: Option<String>,

    /// Aggregation window length, e.g. "3s"
    #[arg(short, long, value_name = "DURATION")]
    window: Option<String>,
}

fn load_config(cli: &Cli) -> netprobe::error::Result<AppConfig> {
    let mut builder = ConfigBuilder::new();
    if let Some(path) = &cli.config {
        builder = builder.add_file(path);
    }
    builder = builder.add_env(ENV_PREFIX);

    if let Some(level) = cli.log_level {
        builder = builder.set("log_level", format!("{:?}", level).to_lowercase());
    }
    if let Some(url) = &cli.elastic {
        builder = builder.set("sink.kind", "elastic").set("sink.url", url.as_str());
    }
    if let Some(window) = &cli.window {
        builder = builder.set("window.duration", window.as_str());
    }
    builder.build()
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn run(config: AppConfig) -> anyhow::Result<ShutdownReport> {
    let pipeline = Pipeline::from_config(config).context("cannot build pipeline")?;
    pipeline.start().context("cannot start pipeline")?;

    wait_for_signal()
        .await
        .context("cannot listen for shutdown signals")?;
    info!("Shutdown requested, draining");

    let repeat = tokio::spawn(async {
        while wait_for_signal().await.is_ok() {
            warn!("Already shutting down, signal ignored");
        }
    });
    let report = pipeline.shutdown().await.context("pipeline already stopped")?;
    repeat.abort();
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("netprobe: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    logging::init(config.log_level);
    info!("netprobe {} starting with {} target(s)", netprobe::VERSION, config.targets.len());

    match run(config).await {
        Ok(report) => {
            println!("{}", report.counters);
            if report.abandoned_probes > 0 {
                warn!("{} probe(s) abandoned at shutdown", report.abandoned_probes);
            }
            if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                eprintln!("netprobe: {} record(s) undelivered", report.undelivered);
                ExitCode::from(EXIT_UNDELIVERED)
            }
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("netprobe: {:#}", e);
            let is_config = e
                .downcast_ref::<AgentError>()
                .is_some_and(AgentError::is_config);
            ExitCode::from(if is_config { EXIT_CONFIG } else { EXIT_UNDELIVERED })
        }
    }
}
