//! fleetscaled, the Fleetscale daemon.
//!
//! Loads `autoscaler.toml`, wires the decision engine to its collaborators
//! and runs the tick loop until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! fleetscaled run --config autoscaler.toml --cluster cluster.json
//! fleetscaled run --config autoscaler.toml --cluster cluster.json --ticks 5
//! fleetscaled check-config --config autoscaler.toml
//! ```
//!
//! `run` drives a simulated cluster loaded from the fixture file; see
//! [`sim`] for the format.

mod sim;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use fleet_core::{AutoscalingOptions, epoch_secs};
use fleetscale_autoscale::{AutoscalingContext, StaticAutoscaler, TickStatus};
use fleetscale_cloud::{CloudProvider, NodeGroup};
use fleetscale_webhook::WebhookDecisionSource;

use crate::sim::{SimCluster, load_fixture};

/// How long shutdown waits for dispatched deletions.
const DELETION_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "fleetscaled", about = "Fleetscale cluster autoscaler daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autoscaler against a simulated cluster.
    Run {
        /// Autoscaler configuration file.
        #[arg(long, default_value = "autoscaler.toml")]
        config: PathBuf,

        /// Cluster fixture (JSON, or TOML by extension).
        #[arg(long)]
        cluster: PathBuf,

        /// Stop after this many ticks instead of waiting for Ctrl-C.
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long, default_value = "autoscaler.toml")]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetscale=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, cluster, ticks } => run(&config, &cluster, ticks).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let options = AutoscalingOptions::from_file(path).with_context(|| format!("invalid config {}", path.display()))?;
    println!("{}", options.to_toml_string()?);
    info!(path = %path.display(), "configuration is valid");
    Ok(())
}

fn build_autoscaler(options: AutoscalingOptions, sim: &SimCluster) -> anyhow::Result<StaticAutoscaler> {
    let webhook = options.webhook.clone();
    let ctx = AutoscalingContext::new(options, sim.cloud.clone(), sim.api.clone());
    let mut autoscaler = StaticAutoscaler::new(Arc::new(ctx));
    if let Some(webhook) = webhook {
        info!(mode = ?webhook.mode, "webhook decision source enabled");
        let source = WebhookDecisionSource::from_options(webhook).context("failed to set up webhook")?;
        autoscaler = autoscaler.with_decision_source(Box::new(source));
    }
    Ok(autoscaler)
}

async fn run(config: &Path, cluster: &Path, ticks: Option<u64>) -> anyhow::Result<()> {
    let options =
        AutoscalingOptions::from_file(config).with_context(|| format!("invalid config {}", config.display()))?;
    let fixture = load_fixture(cluster)?;
    let sim = SimCluster::from_fixture(fixture, options.resource_limits(), &options.gpu_label)?;
    let scan_interval = options.scan_interval;
    let mut autoscaler = build_autoscaler(options, &sim)?;

    info!(config = %config.display(), cluster = %cluster.display(), "fleetscaled starting");

    match ticks {
        Some(count) => {
            for tick in 1..=count {
                match autoscaler.run_once(epoch_secs()).await {
                    Ok(status) => log_tick(tick, &status),
                    Err(e) => warn!(tick, error = %e, kind = %e.kind(), "tick failed"),
                }
                if tick < count {
                    tokio::time::sleep(scan_interval).await;
                }
            }
        }
        None => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            });
            autoscaler.run(shutdown_rx).await;
        }
    }

    if tokio::time::timeout(DELETION_GRACE, autoscaler.actuator().wait_for_deletions())
        .await
        .is_err()
    {
        warn!(grace_secs = DELETION_GRACE.as_secs(), "node deletions still running at exit");
    }
    for group in sim.cloud.node_groups() {
        log_group(group.as_ref());
    }
    info!("fleetscaled stopped");
    Ok(())
}

fn log_tick(tick: u64, status: &TickStatus) {
    info!(
        tick,
        scale_up = ?status.scale_up.as_ref().map(|s| s.result),
        scale_down = ?status.scale_down.as_ref().map(|s| s.result),
        finished_deletions = status.deletion_results.len(),
        "tick complete"
    );
}

fn log_group(group: &dyn NodeGroup) {
    match group.target_size() {
        Ok(target) => info!(group = %group.id(), target, min = group.min_size(), max = group.max_size(), "node group"),
        Err(e) => warn!(group = %group.id(), error = %e, "cannot read target size"),
    }
}
