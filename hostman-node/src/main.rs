//! # hostman Node Agent
//!
//! Runs on each hypervisor host and owns its local storage pools: disk
//! images, snapshot chains and the pool records kept by the control plane.
//!
//! ## Features
//! - Pool accessibility checks at startup
//! - Pool registration and periodic capacity sync
//! - Kubelet-aware capacity reporting
//!
//! ## Usage
//! ```bash
//! hostman-node --config /etc/hostman/host.yaml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use hostman_common::LogFormat;
use hostman_storage::{
    ImageCache, KubeletPolicy, LocalImageCache, QemuImg, ResourcePolicy, StorageManager, StorageServices,
};

mod cli;
mod config;
mod control_plane;
mod deploy_client;
mod fetcher;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};
use control_plane::{api_client, transfer_client, HttpComputeApi, HttpImageRegistry};
use deploy_client::DeployClient;
use fetcher::HttpFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_format: LogFormat = args.log_format.parse()?;
    hostman_common::init_logging(&args.log_level, log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting hostman node agent"
    );

    let config = load_config(&args)?;
    info!(
        master_ip = %config.host.master_ip,
        zone = %config.host.zone,
        pools = config.storage.local_paths.len(),
        "Node agent configured"
    );

    let manager = build_manager(&config).await?;

    let report = manager.check_all().await;
    let healthy = report.iter().filter(|h| h.is_healthy()).count();
    info!(healthy, total = report.len(), "Storage accessibility checked");
    if healthy == 0 && !report.is_empty() {
        warn!("No local storage is accessible");
    }

    if args.no_sync {
        info!("Control-plane sync disabled");
        tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    } else {
        run_sync_loop(&manager, Duration::from_secs(config.control_plane.sync_interval_secs.max(1))).await?;
    }

    info!("Node agent stopped");
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                Ok(cfg.with_cli_overrides(args))
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                Err(e)
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                Ok(cfg.with_cli_overrides(args))
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Ok(Config::default_with_cli(args))
            }
        },
    }
}

async fn build_manager(config: &Config) -> Result<StorageManager> {
    let timeout = Duration::from_secs(config.control_plane.request_timeout_secs.max(1));
    let api = api_client(timeout).context("Failed to build control plane client")?;
    let transfer = transfer_client(timeout).context("Failed to build transfer client")?;

    let tool = Arc::new(QemuImg::with_path(&config.storage.qemu_img_path));
    match tool.version().await {
        Ok(version) => info!(version = %version, "qemu-img available"),
        Err(e) => warn!(error = %e, "qemu-img not available, disk operations will fail"),
    }

    let policy: Option<Arc<dyn ResourcePolicy>> = if config.kubelet.enabled {
        let policy = KubeletPolicy::load(&config.kubelet).context("Failed to load kubelet eviction policy")?;
        Some(Arc::new(policy))
    } else {
        None
    };

    let image_cache: Option<Arc<dyn ImageCache>> = config.storage.image_cache_path.as_ref().map(|path| {
        let cache = LocalImageCache::new(path, tool.clone());
        if let Some(id) = &config.storage.image_cache_id {
            cache.set_id(id);
        }
        info!(path = %path.display(), id = %cache.id(), "Image cache configured");
        Arc::new(cache) as Arc<dyn ImageCache>
    });

    let services = StorageServices {
        tool,
        fetcher: Arc::new(HttpFetcher::new(transfer.clone())),
        compute: Arc::new(HttpComputeApi::new(&config.control_plane.compute_url, api.clone())),
        registry: Arc::new(HttpImageRegistry::new(&config.control_plane.image_url, api.clone(), transfer)),
        inspector: Arc::new(DeployClient::new(&config.control_plane.deploy_url, api)),
        policy,
        image_cache,
    };

    let manager = StorageManager::new(&config.host.master_ip, config.local_storage_options(), services);
    for pool in config.pool_configs() {
        manager
            .add_storage(pool)
            .await
            .context("Failed to add local storage")?;
    }
    Ok(manager)
}

async fn run_sync_loop(manager: &StorageManager, every: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(every);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let failed = manager.sync_all().await;
                if failed > 0 {
                    warn!(failed, "Storage sync incomplete, retrying next interval");
                }
            }
            result = &mut shutdown => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                return Ok(());
            }
        }
    }
}
