//! Thin binary: parses CLI args, loads `AgentConfig`, wires up the
//! `Supervisor`, attaches configured file/container targets, and runs until
//! a shutdown signal arrives.
//!
//! Logging init uses `tracing_subscriber` with an `EnvFilter` (overridable
//! via `RUST_LOG`, defaulting to the config file's `log_level`) layered
//! with the `fmt` layer.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use bollard::Docker;
use clap::Parser;
use ingestd_core::monitors::container_monitor::{ContainerMonitor, ContainerMonitorConfig};
use ingestd_core::monitors::file_monitor::MultilineJoiner;
use ingestd_core::Supervisor;
use regex::Regex;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "ingestd", about = "Host-resident log capture agent")]
struct Args {
    /// Path to the agent's TOML configuration file.
    #[arg(short, long, default_value = "/etc/ingestd/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match AgentConfig::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            // tracing isn't initialized yet; this is the one place we log
            // to stderr directly.
            eprintln!("failed to load config from {}: {e}", args.config.display());
            return Err(e);
        }
    };

    init_logging(&config.log_level);
    info!(config_path = %args.config.display(), "ingestd starting");

    let supervisor = Supervisor::new(config.to_supervisor_config())?;
    supervisor.start().await?;

    attach_file_targets(&supervisor, &config).await;
    let container_monitor = attach_container_monitor(&supervisor, &config).await;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    if let Some(container_monitor) = container_monitor {
        container_monitor
            .stop(std::time::Duration::from_secs(config.shutdown_deadline_secs))
            .await;
    }
    supervisor.shutdown().await;

    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn attach_file_targets(supervisor: &Arc<Supervisor>, config: &AgentConfig) {
    for target in &config.files {
        let joiner = match &target.multiline_start_pattern {
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => MultilineJoiner::RegexContinuation { starts_new_entry: re },
                Err(e) => {
                    warn!(pattern, error = %e, "invalid multiline pattern, treating every line as its own entry");
                    MultilineJoiner::None
                }
            },
            None => MultilineJoiner::None,
        };

        if let Err(e) = supervisor
            .file_monitor
            .add_file(target.path.clone(), target.labels.clone(), joiner, None)
            .await
        {
            error!(path = %target.path.display(), error = %e, "failed to attach file target");
        } else {
            info!(path = %target.path.display(), "attached file target");
        }
    }
}

async fn attach_container_monitor(
    supervisor: &Arc<Supervisor>,
    config: &AgentConfig,
) -> Option<Arc<ContainerMonitor>> {
    if !config.containers.enabled {
        return None;
    }

    let docker = match Docker::connect_with_local_defaults() {
        Ok(docker) => docker,
        Err(e) => {
            error!(error = %e, "failed to connect to docker, container log capture disabled");
            return None;
        }
    };

    let monitor = ContainerMonitor::new(
        ContainerMonitorConfig {
            discovery_interval: std::time::Duration::from_secs(config.containers.discovery_interval_secs),
            stream_max_lifetime: std::time::Duration::from_secs(config.containers.stream_max_lifetime_secs),
            ..Default::default()
        },
        docker,
        Arc::clone(&supervisor.dispatcher),
        Arc::clone(&supervisor.file_monitor),
    );

    if let Err(e) = monitor.start().await {
        error!(error = %e, "failed to start container monitor");
        return None;
    }
    supervisor.attach_container_monitor(Arc::clone(&monitor)).await;
    info!("container monitor started");
    Some(monitor)
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
