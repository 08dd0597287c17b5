use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use farmhand::config::{InstanceConfig, WorkerConfig};
use farmhand::instance::{Instance, MemoryInstance};
use farmhand::worker::{shutdown_token, Worker};

#[derive(Parser, Debug)]
#[command(name = "farmhand")]
#[command(about = "A remote execution worker with a content-addressed file cache")]
struct Args {
    /// Path to the worker configuration file
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = WorkerConfig::from_path(&args.config_path)?;

    let instance: Arc<dyn Instance> = match &config.instance {
        InstanceConfig::MemoryInstance(memory_config) => Arc::new(MemoryInstance::new(
            config.instance_name.clone(),
            memory_config.clone(),
        )),
    };

    tracing::info!(
        instance_name = %config.instance_name,
        root = %config.root,
        cas_cache_directory = %config.cas_cache_directory,
        cas_cache_max_size_bytes = config.cas_cache_max_size_bytes,
        "Starting farmhand worker"
    );

    let shutdown = shutdown_token();
    let worker = Arc::new(Worker::new(config, instance)?);
    worker.start(shutdown).await?;

    Ok(())
}
