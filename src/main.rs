use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use sandbox_manager::jobs::{process_job, JobOutcome};
use sandbox_manager::redis_manager::{RedisManager, ResultPublisher};
use sandbox_manager::{ContainerRuntime, DockerCli, LifecycleManager, ManagerConfig, Reaper};

#[derive(Debug, Parser)]
#[command(name = "sandbox-manager", about = "Sandbox container lifecycle manager")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve lifecycle jobs from Redis and sweep periodically (default)
    Worker,
    /// Reclaim every prefixed container once, print the result and exit
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandbox_manager=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = ManagerConfig::load(cli.config.as_deref())?;
    info!(
        "Sandbox config: prefix={}, image={}, idle_timeout={:?}, sweep_interval={:?}",
        config.prefix, config.base_image, config.idle_timeout, config.sweep_interval
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::from_config(&config));

    match cli.command.unwrap_or(Command::Worker) {
        Command::Sweep => {
            let reaper = Reaper::new(runtime, &config)?;
            let result = reaper.sweep().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Worker => run_worker(runtime, config).await?,
    }

    Ok(())
}

async fn run_worker(runtime: Arc<dyn ContainerRuntime>, config: ManagerConfig) -> Result<()> {
    info!("Starting Sandbox Worker...");

    let manager = Arc::new(LifecycleManager::new(runtime, config)?);
    let reaper = manager.reaper()?;
    info!(
        "Managing containers under {}",
        manager.naming().namespace()
    );

    let mut redis = RedisManager::from_env().await?;
    let publisher = redis.publisher();

    let sweep_publisher = publisher.clone();
    let sweeper = reaper
        .clone()
        .spawn(manager.config().sweep_interval, move |result| {
            let mut publisher = sweep_publisher.clone();
            tokio::spawn(async move {
                if let Err(e) = publisher.publish_sweep(&result).await {
                    warn!("Failed to publish sweep result: {}", e);
                }
            });
        });

    info!("Waiting for jobs...");

    loop {
        let job = tokio::select! {
            job = redis.pop_job() => job?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        };

        let manager = manager.clone();
        let reaper = reaper.clone();
        let publisher = publisher.clone();
        tokio::spawn(async move {
            let outcome = process_job(&manager, &reaper, job).await;
            publish_outcome(publisher, outcome).await;
        });
    }

    sweeper.abort();
    Ok(())
}

async fn publish_outcome(mut publisher: ResultPublisher, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Request(result) => {
            info!(
                "Job completed: request_id={}, operation={}, success={}",
                result.request_id, result.operation, result.success
            );
            if let Err(e) = publisher.store_job_result(&result).await {
                error!(
                    "Failed to store result for request {}: {}",
                    result.request_id, e
                );
            }
        }
        JobOutcome::Sweep(result) => {
            if let Err(e) = publisher.publish_sweep(&result).await {
                error!("Failed to publish sweep result: {}", e);
            }
        }
    }
}
