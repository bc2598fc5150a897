//! Per-pool disk handle cache.
//!
//! The filesystem is authoritative; the cache only memoizes handles and
//! re-probes them on every lookup. The lock is held for map access only,
//! never across a probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::traits::Disk;

type DiskFactory = Box<dyn Fn(&str) -> Arc<dyn Disk> + Send + Sync>;

/// Disk handles of one storage pool, keyed by disk id.
pub struct DiskCache {
    disks: Mutex<HashMap<String, Arc<dyn Disk>>>,
    factory: DiskFactory,
}

impl DiskCache {
    /// Create an empty cache building handles with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn Disk> + Send + Sync + 'static,
    {
        Self {
            disks: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<dyn Disk>>>> {
        self.disks
            .lock()
            .map_err(|_| StorageError::Internal("Lock poisoned".to_string()))
    }

    /// Return the handle of an existing disk.
    ///
    /// Fails with `NotFound` when the disk file is absent or unreadable. A
    /// cached handle whose file disappeared is evicted.
    pub async fn get_or_create(&self, disk_id: &str) -> Result<Arc<dyn Disk>> {
        let cached = self.lock()?.get(disk_id).cloned();

        if let Some(disk) = cached {
            if let Err(e) = disk.probe().await {
                debug!(disk_id = %disk_id, error = %e, "Cached disk failed probe, evicting");
                let mut disks = self.lock()?;
                if disks.get(disk_id).is_some_and(|d| Arc::ptr_eq(d, &disk)) {
                    disks.remove(disk_id);
                }
                return Err(StorageError::NotFound(format!("disk {}", disk_id)));
            }
            return Ok(disk);
        }

        let disk = (self.factory)(disk_id);
        if let Err(e) = disk.probe().await {
            debug!(disk_id = %disk_id, error = %e, "Disk probe failed");
            return Err(StorageError::NotFound(format!("disk {}", disk_id)));
        }

        let mut disks = self.lock()?;
        Ok(disks.entry(disk_id.to_string()).or_insert(disk).clone())
    }

    /// Register a handle for a disk about to be created.
    ///
    /// Does not probe. An existing handle for the same id is returned instead
    /// of inserting a second one.
    pub fn create(&self, disk_id: &str) -> Result<Arc<dyn Disk>> {
        let mut disks = self.lock()?;
        let disk = disks
            .entry(disk_id.to_string())
            .or_insert_with(|| (self.factory)(disk_id));
        Ok(disk.clone())
    }

    /// Cached handle, without probing.
    pub fn get(&self, disk_id: &str) -> Option<Arc<dyn Disk>> {
        self.lock().ok()?.get(disk_id).cloned()
    }

    /// Drop the handle of a deleted disk.
    pub fn remove(&self, disk_id: &str) -> Option<Arc<dyn Disk>> {
        self.lock().ok()?.remove(disk_id)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{LocalDisk, LocalDiskEnv};
    use crate::mock::{MockFetcher, MockImageTool};
    use crate::types::LocalStorageOptions;
    use std::path::Path;

    fn cache_at(root: &Path, tool: Arc<MockImageTool>) -> DiskCache {
        let env = LocalDiskEnv {
            pool_path: root.to_path_buf(),
            options: LocalStorageOptions::default(),
            tool,
            fetcher: Arc::new(MockFetcher::new()),
        };
        DiskCache::new(move |id| Arc::new(LocalDisk::new(env.clone(), id)) as Arc<dyn Disk>)
    }

    #[tokio::test]
    async fn test_missing_disk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), Arc::new(MockImageTool::new()));

        let err = cache.get_or_create("missing-id").await.err().unwrap();
        assert!(err.is_not_found());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockImageTool::new());
        tool.write_image(&dir.path().join("d1"), None).unwrap();
        let cache = cache_at(dir.path(), tool.clone());

        let first = cache.get_or_create("d1").await.unwrap();
        assert_eq!(tool.info_calls(), 1);
        let second = cache.get_or_create("d1").await.unwrap();
        assert_eq!(tool.info_calls(), 2);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.path(), second.path());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockImageTool::new());
        let path = dir.path().join("d1");
        tool.write_image(&path, None).unwrap();
        let cache = cache_at(dir.path(), tool);

        cache.get_or_create("d1").await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(cache.get_or_create("d1").await.err().unwrap().is_not_found());
        assert!(cache.get("d1").is_none());
    }

    #[tokio::test]
    async fn test_create_does_not_duplicate_handles() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockImageTool::new());
        let cache = cache_at(dir.path(), tool.clone());

        let created = cache.create("d1").unwrap();
        assert_eq!(tool.info_calls(), 0);
        let again = cache.create("d1").unwrap();
        assert!(Arc::ptr_eq(&created, &again));

        tool.write_image(&created.path(), None).unwrap();
        let found = cache.get_or_create("d1").await.unwrap();
        assert!(Arc::ptr_eq(&created, &found));
    }
}
