mod config;
mod state_log;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use discovery_client::config::MEMORY_CONNECT;
use discovery_client::{
    BuildPathJob, CoordinationStore, DiscoveryClient, DiscoveryConfig, JobProcessor, MemoryStore,
    ReadOnlyDiscoveryClient, ServiceDiscovery,
};
use crate::config::{Config, DaemonConfig};

/// Upper bound for building the discovery root at startup
const BUILD_ROOT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(feature = "zookeeper")]
fn remote_store(connect: &str) -> Result<Arc<dyn CoordinationStore>> {
    Ok(Arc::new(discovery_client::store::ZooKeeperStore::new(connect)))
}

#[cfg(not(feature = "zookeeper"))]
fn remote_store(connect: &str) -> Result<Arc<dyn CoordinationStore>> {
    anyhow::bail!(
        "Cannot connect to {}: discoveryd was built without the zookeeper feature",
        connect
    )
}

fn open_store(config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationStore>> {
    if config.connect == MEMORY_CONNECT {
        tracing::info!("Using the in-process coordination store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    tracing::info!("Using coordination store at {}", config.connect);
    remote_store(&config.connect)
}

/// Makes sure the discovery root exists before anything is announced below it
async fn build_root(
    processor: &JobProcessor,
    root: &str,
    daemon: &DaemonConfig,
) -> Result<()> {
    let mut handle = processor
        .submit_job_timeout(BuildPathJob::new(root), daemon.build_attempts, BUILD_ROOT_TIMEOUT)
        .await
        .context("Job queue is full")?;

    handle
        .get_timeout(BUILD_ROOT_TIMEOUT)
        .await
        .with_context(|| format!("Failed to build discovery root {}", root))?;

    tracing::info!("Discovery root {} is present", root);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("discoveryd=info,discovery_client=info"))
        )
        .init();

    tracing::info!("Starting discoveryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/discoveryd/discoveryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    if !config.discovery.enabled {
        anyhow::bail!("Service discovery is disabled, set discovery.enabled in {}", config_path);
    }

    // Validate static announcements before touching the store
    let static_records = config
        .static_announce
        .iter()
        .map(|entry| entry.to_record())
        .collect::<Result<Vec<_>>>()?;

    let store = open_store(&config.discovery)?;

    // Job processor with its own session, used for setup work
    let processor = JobProcessor::new(Arc::clone(&store), &config.discovery);
    processor.start().await;

    if config.daemon.build_root_path {
        build_root(&processor, &config.discovery.root, &config.daemon).await?;
    }

    // Start the discovery client
    let client = Arc::new(ServiceDiscovery::read_write(
        Arc::clone(&store),
        config.discovery.clone(),
    ));
    client.start().await;

    if !client
        .wait_for_world_change(config.discovery.world_change_timeout())
        .await
    {
        tracing::warn!(
            "No state of the world after {:?}, announcing anyway",
            config.discovery.world_change_timeout()
        );
    }

    for record in static_records {
        tracing::info!(
            "Configured static announcement: {} ({})",
            record.announcement_name(),
            record.service_id()
        );
        client
            .announce(record)
            .context("Failed to announce static service")?;
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn state logger task
    let logger_cancel = cancel.clone();
    let logger_client = Arc::clone(&client);
    let logger_interval = Duration::from_secs(config.daemon.state_log_interval_secs.max(1));
    let logger_handle = tokio::spawn(async move {
        state_log::run(logger_client, logger_interval, logger_cancel).await;
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    if let Err(e) = logger_handle.await {
        tracing::error!("State logger failed: {}", e);
    }

    // Static announcements stay in the store, everything else goes with the session
    client.stop().await;
    processor.stop().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
