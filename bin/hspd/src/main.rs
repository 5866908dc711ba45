//! ---
//! hsp_section: "01-core-functionality"
//! hsp_subsection: "binary"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Binary entrypoint for the HSP bridge daemon."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use hsp_common::{init_tracing, new_registry, BridgeConfig};
use hsp_connector::{Connector, ConnectorError};
use tracing::{debug, info, warn};

mod exporter;

use exporter::{spawn_http_server, DaemonMetrics};

#[derive(Debug, Parser)]
#[command(author, version, about = "HSP messaging bridge daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the configured node_id")]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the bridge until interrupted")]
    Run,
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/hspd.toml"));

    let load_started = Instant::now();
    let loaded = BridgeConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded.config;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
        config.validate()?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("# source: {}", loaded.source.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run => {
            init_tracing("hspd", &config.logging)?;
            info!(
                config_path = %loaded.source.display(),
                node_id = %config.node_id,
                "configuration loaded"
            );
            run_daemon(config, load_duration.as_secs_f64()).await
        }
    }
}

async fn run_daemon(config: BridgeConfig, config_load_seconds: f64) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.inc_start();
    daemon_metrics.observe_config_load(config_load_seconds);

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry.clone(), config.metrics.listen).await?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let health_interval = config
        .fallback
        .health_check_interval
        .max(Duration::from_secs(1));
    let connector = Connector::builder(config).registry(registry).build()?;
    match connector.connect().await {
        Ok(()) => {}
        Err(err @ ConnectorError::ConnectFailed { .. }) => {
            warn!(error = %err, "starting on fallback protocols; broker retried in background");
        }
        Err(err) => return Err(err.into()),
    }
    daemon_metrics.set_primary_connected(connector.is_connected());
    let status = connector.communication_status();
    info!(
        node_id = %status.node_id,
        level = %status.level,
        state = %status.state,
        "bridge running; waiting for termination signal"
    );

    let mut ticker = tokio::time::interval(health_interval);
    ticker.tick().await;
    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = ticker.tick() => {
                let report = connector.health_check().await;
                daemon_metrics.set_primary_connected(report.primary_connected);
                debug!(
                    healthy = report.healthy,
                    level = %report.level,
                    fallback = ?report.fallback_protocol,
                    circuit = %report.circuit_state,
                    "health check"
                );
            }
        }
    }

    info!("termination signal received; shutting down");
    connector.shutdown().await;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
