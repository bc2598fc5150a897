//! Host storage manager.
//!
//! Owns the local pools of this host and the collaborators they share. Built
//! once at startup and passed to whoever needs pool lookup.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::local::{LocalStorage, StorageServices};
use crate::traits::ImageCache;
use crate::types::{LocalStorageOptions, PoolConfig};

/// Outcome of one pool accessibility check.
#[derive(Debug)]
pub struct PoolHealth {
    pub index: usize,
    pub path: std::path::PathBuf,
    pub result: Result<()>,
}

impl PoolHealth {
    pub fn is_healthy(&self) -> bool {
        self.result.is_ok()
    }
}

/// Local storage pools of one host.
pub struct StorageManager {
    master_ip: String,
    options: LocalStorageOptions,
    services: StorageServices,
    /// Pools in index order
    storages: RwLock<Vec<Arc<LocalStorage>>>,
}

impl StorageManager {
    pub fn new(master_ip: &str, options: LocalStorageOptions, services: StorageServices) -> Self {
        Self {
            master_ip: master_ip.to_string(),
            options,
            services,
            storages: RwLock::new(Vec::new()),
        }
    }

    /// Add a pool. Paths must be unique.
    #[instrument(skip(self, config), fields(path = %config.path.display(), index = config.index))]
    pub async fn add_storage(&self, config: PoolConfig) -> Result<Arc<LocalStorage>> {
        let mut storages = self.storages.write().await;
        if storages.iter().any(|s| s.path() == config.path) {
            return Err(StorageError::InvalidConfig(format!(
                "storage path {} configured twice",
                config.path.display()
            )));
        }

        let storage = Arc::new(LocalStorage::new(
            config,
            self.options.clone(),
            &self.master_ip,
            self.services.clone(),
        ));
        storages.push(storage.clone());
        info!(name = %storage.name(), "Local storage added");
        Ok(storage)
    }

    pub async fn storages(&self) -> Vec<Arc<LocalStorage>> {
        self.storages.read().await.clone()
    }

    /// Pool registered under `storage_id`.
    pub async fn get_storage(&self, storage_id: &str) -> Option<Arc<LocalStorage>> {
        if storage_id.is_empty() {
            return None;
        }
        let storages = self.storages.read().await;
        storages.iter().find(|s| s.id() == storage_id).cloned()
    }

    /// Pool rooted at `path`.
    pub async fn get_storage_by_path(&self, path: &Path) -> Option<Arc<LocalStorage>> {
        let storages = self.storages.read().await;
        storages.iter().find(|s| s.path() == path).cloned()
    }

    pub async fn get_storage_by_index(&self, index: usize) -> Option<Arc<LocalStorage>> {
        let storages = self.storages.read().await;
        storages.iter().find(|s| s.index() == index).cloned()
    }

    pub fn image_cache(&self) -> Option<&Arc<dyn ImageCache>> {
        self.services.image_cache.as_ref()
    }

    /// Probe every pool root.
    pub async fn check_all(&self) -> Vec<PoolHealth> {
        let mut report = Vec::new();
        for storage in self.storages().await {
            let result = storage.accessible().await;
            match &result {
                Ok(()) => info!(path = %storage.path().display(), "Storage accessible"),
                Err(e @ StorageError::Timeout(_)) => {
                    warn!(path = %storage.path().display(), error = %e, "Storage health unknown")
                }
                Err(e) => error!(path = %storage.path().display(), error = %e, "Storage not accessible"),
            }
            report.push(PoolHealth {
                index: storage.index(),
                path: storage.path().to_path_buf(),
                result,
            });
        }
        report
    }

    /// Sync every pool with the control plane; returns how many failed.
    pub async fn sync_all(&self) -> usize {
        let mut failed = 0;
        for storage in self.storages().await {
            if let Err(e) = storage.sync_storage_info().await {
                warn!(name = %storage.name(), error = %e, "Storage sync failed");
                failed += 1;
            }
        }
        failed
    }
}
