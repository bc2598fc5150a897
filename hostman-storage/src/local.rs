//! Local filesystem storage pool.
//!
//! Composes the disk cache, accessibility probe, capacity accounting,
//! snapshot transfer, migration and export behind one pool handle.

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{error, info, instrument, warn};

use crate::accessible::check_accessible;
use crate::cache::DiskCache;
use crate::capacity::{available_capacity_mb, fs_stats};
use crate::disk::{LocalDisk, LocalDiskEnv, FUSE_MOUNT_DIR, FUSE_TMP_DIR, SNAPSHOT_DIR};
use crate::error::{Result, StorageError};
use crate::export::ImageExporter;
use crate::image_cache::template_path_in;
use crate::migrate::MigrationPreparer;
use crate::snapshot::fetch_snapshot;
use crate::traits::{ComputeApi, Disk, ImageCache, ImageRegistry, ImageTool, OsInspector, RemoteFetcher, ResourcePolicy};
use crate::types::{
    ExportRequest, FsStats, LocalStorageOptions, MigrateRequest, MigrationDescriptor, PoolConfig,
    SnapshotSource, StorageSyncInfo, STORAGE_LOCAL,
};

const RECYCLE_BIN_DIR: &str = "recycle_bin";
const IMGSAVE_BACKUPS_DIR: &str = "imgsave_backups";

/// Transfer mode served by [`LocalStorage::create_disk_from_snapshot`].
pub const PROTOCOL_FUSE: &str = "fuse";

/// Collaborators shared by the pools of one host.
#[derive(Clone)]
pub struct StorageServices {
    pub tool: Arc<dyn ImageTool>,
    pub fetcher: Arc<dyn RemoteFetcher>,
    pub compute: Arc<dyn ComputeApi>,
    pub registry: Arc<dyn ImageRegistry>,
    pub inspector: Arc<dyn OsInspector>,
    pub policy: Option<Arc<dyn ResourcePolicy>>,
    pub image_cache: Option<Arc<dyn ImageCache>>,
}

/// A storage pool rooted at a local directory.
pub struct LocalStorage {
    /// Control-plane identifier, empty until registered
    id: RwLock<String>,
    config: PoolConfig,
    options: LocalStorageOptions,
    master_ip: String,
    services: StorageServices,
    disks: DiskCache,
}

impl LocalStorage {
    pub fn new(config: PoolConfig, options: LocalStorageOptions, master_ip: &str, services: StorageServices) -> Self {
        let env = LocalDiskEnv {
            pool_path: config.path.clone(),
            options: options.clone(),
            tool: services.tool.clone(),
            fetcher: services.fetcher.clone(),
        };
        let disks = DiskCache::new(move |id| Arc::new(LocalDisk::new(env.clone(), id)) as Arc<dyn Disk>);

        Self {
            id: RwLock::new(String::new()),
            config,
            options,
            master_ip: master_ip.to_string(),
            services,
            disks,
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn id(&self) -> String {
        self.id.read().map(|id| id.clone()).unwrap_or_default()
    }

    pub fn set_id(&self, id: &str) {
        match self.id.write() {
            Ok(mut slot) => *slot = id.to_string(),
            Err(_) => warn!(id = %id, "Storage id lock poisoned"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn index(&self) -> usize {
        self.config.index
    }

    pub fn storage_type(&self) -> &'static str {
        STORAGE_LOCAL
    }

    pub fn zone(&self) -> &str {
        &self.config.zone
    }

    /// `host_<master_ip>_local_storage_<index>`
    pub fn composed_name(&self) -> String {
        format!(
            "host_{}_{}_storage_{}",
            self.master_ip,
            self.storage_type(),
            self.config.index
        )
    }

    /// Configured name, or the composed name.
    pub fn name(&self) -> String {
        self.config
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.composed_name())
    }

    pub fn image_cache(&self) -> Option<&Arc<dyn ImageCache>> {
        self.services.image_cache.as_ref()
    }

    // =========================================================================
    // Layout
    // =========================================================================

    pub fn snapshot_dir(&self) -> PathBuf {
        self.config.path.join(SNAPSHOT_DIR)
    }

    fn disk_snapshot_dir(&self, disk_id: &str) -> PathBuf {
        self.snapshot_dir()
            .join(format!("{}{}", disk_id, self.options.snapshot_dir_suffix))
    }

    pub fn snapshot_path_by_ids(&self, disk_id: &str, snapshot_id: &str) -> PathBuf {
        self.disk_snapshot_dir(disk_id).join(snapshot_id)
    }

    pub fn is_snapshot_exist(&self, disk_id: &str, snapshot_id: &str) -> bool {
        self.snapshot_path_by_ids(disk_id, snapshot_id).exists()
    }

    pub fn fuse_tmp_path(&self) -> PathBuf {
        self.config.path.join(FUSE_TMP_DIR)
    }

    pub fn fuse_mount_path(&self) -> PathBuf {
        self.config.path.join(FUSE_MOUNT_DIR)
    }

    /// Today's recycle directory.
    pub fn recycle_path(&self) -> PathBuf {
        self.dated_subdir(RECYCLE_BIN_DIR)
    }

    /// Today's directory for images saved before export.
    pub fn imgsave_backup_path(&self) -> PathBuf {
        self.dated_subdir(IMGSAVE_BACKUPS_DIR)
    }

    fn dated_subdir(&self, subdir: &str) -> PathBuf {
        self.config
            .path
            .join(subdir)
            .join(Local::now().format("%Y%m%d").to_string())
    }

    /// Cache path of a template image.
    pub fn template_path(&self, template_id: &str) -> Option<PathBuf> {
        self.services
            .image_cache
            .as_ref()
            .map(|cache| template_path_in(&cache.path(), template_id))
    }

    // =========================================================================
    // Capacity and sync
    // =========================================================================

    /// Free space in MiB, reduced by the node's eviction floors.
    pub async fn avail_size_mb(&self) -> Result<u64> {
        let stats = fs_stats(&self.config.path).await?;
        Ok(self.adjusted_available_mb(&stats))
    }

    pub async fn used_size_mb(&self) -> Result<u64> {
        Ok(fs_stats(&self.config.path).await?.used_mb())
    }

    fn adjusted_available_mb(&self, stats: &FsStats) -> u64 {
        available_capacity_mb(
            stats.available_mb(),
            self.services.policy.as_deref(),
            &self.config.path,
        )
    }

    fn sync_info(&self, stats: &FsStats) -> StorageSyncInfo {
        let storagecache_id = self
            .services
            .image_cache
            .as_ref()
            .map(|cache| cache.id())
            .filter(|id| !id.is_empty());

        StorageSyncInfo {
            name: self.name(),
            capacity: self.adjusted_available_mb(stats),
            actual_capacity_used: stats.used_mb(),
            storage_type: self.storage_type().to_string(),
            medium_type: self.config.medium_type.as_str().to_string(),
            zone: self.config.zone.clone(),
            storagecache_id,
        }
    }

    /// Register or refresh this pool on the control plane.
    #[instrument(skip(self), fields(path = %self.config.path.display()))]
    pub async fn sync_storage_info(&self) -> Result<StorageSyncInfo> {
        let stats = fs_stats(&self.config.path).await?;
        let info = self.sync_info(&stats);
        self.push_sync_info(&info).await?;
        Ok(info)
    }

    async fn push_sync_info(&self, info: &StorageSyncInfo) -> Result<()> {
        let storage_id = self.id();
        info!(storage_id = %storage_id, name = %info.name, "Sync storage info");

        let result = if storage_id.is_empty() {
            self.services.compute.create_storage(info).await.map(|id| {
                info!(storage_id = %id, "Storage registered");
                self.set_id(&id);
            })
        } else {
            self.services.compute.update_storage(&storage_id, info).await
        };

        if let Err(e) = &result {
            error!(info = ?info, error = %e, "Sync storage info failed");
        }
        result
    }

    /// Push only the used capacity of a registered pool.
    pub async fn sync_storage_size(&self) -> Result<()> {
        let storage_id = self.id();
        if storage_id.is_empty() {
            warn!(path = %self.config.path.display(), "Storage not registered yet, skipping size sync");
            return Ok(());
        }
        let used_mb = self.used_size_mb().await?;
        self.services.compute.update_storage_used(&storage_id, used_mb).await
    }

    // =========================================================================
    // Disks
    // =========================================================================

    /// Handle of an existing disk; `NotFound` when it is absent.
    pub async fn get_disk_by_id(&self, disk_id: &str) -> Result<Arc<dyn Disk>> {
        self.disks.get_or_create(disk_id).await
    }

    /// Handle for a disk about to be created.
    pub fn create_disk(&self, disk_id: &str) -> Result<Arc<dyn Disk>> {
        self.disks.create(disk_id)
    }

    pub fn disks(&self) -> &DiskCache {
        &self.disks
    }

    pub async fn accessible(&self) -> Result<()> {
        check_accessible(&self.config.path).await
    }

    /// Local pools hold no attachment.
    pub async fn detach(&self) -> Result<()> {
        Ok(())
    }

    /// Recycle or remove a disk file. An absent path is not an error.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn delete_diskfile(&self, path: &Path) -> Result<()> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        if self.options.recycle_diskfile {
            let dest_dir = self.recycle_path();
            tokio::fs::create_dir_all(&dest_dir)
                .await
                .map_err(|e| StorageError::io(&dest_dir, e))?;

            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let dest = unused_recycle_name(&dest_dir, &base, Utc::now().timestamp()).await;
            info!(dest = %dest.display(), "Move deleted disk file to recycle");
            tokio::fs::rename(path, &dest)
                .await
                .map_err(|e| StorageError::io(path, e))
        } else {
            info!("Delete disk file immediately");
            let removed = if meta.is_dir() {
                tokio::fs::remove_dir_all(path).await
            } else {
                tokio::fs::remove_file(path).await
            };
            removed.map_err(|e| StorageError::io(path, e))
        }
    }

    /// Delete a disk file and forget its handle.
    pub async fn delete_disk(&self, disk_id: &str) -> Result<()> {
        self.delete_diskfile(&self.config.path.join(disk_id)).await?;
        self.disks.remove(disk_id);
        Ok(())
    }

    /// Remove every snapshot of a disk.
    pub async fn delete_snapshots(&self, disk_id: &str) -> Result<()> {
        let dir = self.disk_snapshot_dir(disk_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StorageError::io(&dir, e)),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Snapshots, migration and export
    // =========================================================================

    pub async fn create_snapshot_from_url(&self, url: &str, disk_id: &str, snapshot_path: &Path) -> Result<()> {
        info!(disk_id = %disk_id, "Creating snapshot from url");
        fetch_snapshot(self.services.fetcher.as_ref(), url, snapshot_path).await
    }

    /// Rebuild a migrated disk and its snapshot chain in this pool.
    pub async fn destination_prepare_migrate(&self, req: &MigrateRequest, desc: &mut MigrationDescriptor) -> Result<()> {
        let mut preparer = MigrationPreparer::new(
            &self.disks,
            self.services.tool.as_ref(),
            self.services.fetcher.as_ref(),
        );
        if let Some(cache) = &self.services.image_cache {
            preparer = preparer.with_image_cache(cache.path());
        }
        preparer.prepare(req, desc).await
    }

    /// Export a disk image to the image registry.
    pub async fn save_to_image_registry(&self, req: &ExportRequest) -> Result<()> {
        ImageExporter::new(
            self.services.tool.as_ref(),
            self.services.inspector.as_ref(),
            self.services.registry.as_ref(),
            self.services.compute.as_ref(),
        )
        .with_image_cache(self.services.image_cache.as_deref())
        .with_default_format(self.options.default_image_save_format)
        .export(req)
        .await
    }

    pub async fn create_disk_from_snapshot(&self, disk: &dyn Disk, source: &SnapshotSource) -> Result<()> {
        if source.protocol != PROTOCOL_FUSE {
            return Err(StorageError::UnsupportedProtocol(source.protocol.clone()));
        }
        disk.create_from_image_fuse(&source.snapshot_url, source.size_mb).await
    }
}

/// `<dir>/<base>.<ts>`, with a counter appended when that name is taken.
async fn unused_recycle_name(dir: &Path, base: &str, ts: i64) -> PathBuf {
    let mut dest = dir.join(format!("{}.{}", base, ts));
    let mut n = 1;
    while tokio::fs::symlink_metadata(&dest).await.is_ok() {
        dest = dir.join(format!("{}.{}.{}", base, ts, n));
        n += 1;
    }
    dest
}
