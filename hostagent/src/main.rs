//! hostagent: runs tasks on this host and reports their state changes.
//!
//! Without a container daemon integration the agent drives the in-memory
//! runtime, which makes it useful for exercising task definitions locally:
//! pass a JSON file with an array of tasks via `--tasks` and watch the
//! state change stream in the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hostagent::{Config, Engine, HostResources, MockRuntime, NoopProvisioner, Task};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Host task agent
#[derive(Parser, Debug)]
#[command(name = "hostagent", version, about)]
struct Args {
    /// CPU units available to tasks
    #[arg(long, default_value = "1024")]
    cpu_units: u64,

    /// Memory in MB available to tasks
    #[arg(long, default_value = "2048")]
    memory_mb: u64,

    /// Extra TCP ports to keep away from tasks (comma separated)
    #[arg(long, value_delimiter = ',')]
    reserved_tcp_ports: Vec<u16>,

    /// State file for checkpoints (no persistence if unset)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// JSON file with tasks to add on startup
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Seconds a stopped task is kept before cleanup
    #[arg(long, default_value = "10800")]
    cleanup_wait: u64,

    /// Steady state poll interval in seconds
    #[arg(long, default_value = "10")]
    poll_interval: u64,

    /// Checkpoint interval in seconds
    #[arg(long, default_value = "30")]
    checkpoint_interval: u64,
}

impl Args {
    fn config(&self) -> Config {
        let mut host = HostResources {
            cpu_units: self.cpu_units,
            memory_mb: self.memory_mb,
            ..HostResources::default()
        };
        host.reserved_ports_tcp
            .extend(self.reserved_tcp_ports.iter().copied());

        Config {
            host,
            state_file: self.state_file.clone(),
            task_cleanup_wait: Duration::from_secs(self.cleanup_wait),
            steady_state_poll_interval: Duration::from_secs(self.poll_interval),
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval),
            ..Config::default()
        }
    }
}

async fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostagent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.config();

    info!("Starting hostagent {}", Engine::version());
    info!(
        "Host capacity: {} cpu units, {} MB memory",
        config.host.cpu_units, config.host.memory_mb
    );

    let runtime = Arc::new(MockRuntime::new());
    let provisioner = Arc::new(NoopProvisioner::new());
    let (engine, mut events) = Engine::start(config, runtime, provisioner).await?;

    if let Some(path) = &args.tasks {
        for task in load_tasks(path).await? {
            let arn = task.arn.clone();
            if let Err(e) = engine.add_task(task).await {
                error!("Failed to add task {}: {}", arn, e);
            }
        }
    }

    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            change = events.recv() => {
                let Some(change) = change else { break };
                match serde_json::to_string(&change) {
                    Ok(json) => info!("State change: {}", json),
                    Err(e) => error!("Failed to encode state change: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    engine.shutdown().await?;
    info!("hostagent stopped");
    Ok(())
}
