//! Collaborator traits consumed by the storage engine.
//!
//! The engine depends only on these seams; the host agent supplies the
//! HTTP-backed implementations and the `mock` module supplies fakes.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::capacity::EvictionPolicy;
use crate::error::Result;
use crate::types::{CreateRawOptions, DiskFormat, DiskInfo, ImageUploadParams, OsInfo, StorageSyncInfo};

/// One disk image owned by a storage pool.
#[async_trait]
pub trait Disk: Send + Sync {
    /// Disk identifier.
    fn id(&self) -> &str;

    /// Path of the disk image file.
    fn path(&self) -> PathBuf;

    /// Directory holding this disk's snapshots.
    fn snapshot_dir(&self) -> PathBuf;

    /// Refresh on-disk state.
    ///
    /// Fails with `NotFound` when the file is absent or unreadable as a disk.
    async fn probe(&self) -> Result<()>;

    /// Last probed image info, if any.
    fn info(&self) -> Option<DiskInfo>;

    /// Create a new empty (or copy-on-write) image file.
    async fn create_raw(&self, opts: &CreateRawOptions) -> Result<DiskInfo>;

    /// Download the full image from `url`, retrying up to `retries` extra times.
    async fn create_from_url(&self, url: &str, retries: u32) -> Result<()>;

    /// Create an overlay backed by a remote image exposed through FUSE.
    async fn create_from_image_fuse(&self, url: &str, size_mb: u64) -> Result<()>;
}

/// Shared content-addressed store of base and template images.
#[async_trait]
pub trait ImageCache: Send + Sync {
    /// Control-plane identifier; empty until registered.
    fn id(&self) -> String;

    /// Directory holding cached images.
    fn path(&self) -> PathBuf;

    /// Register the image file `<path>/<image_id>` as cached.
    async fn load_image_cache(&self, image_id: &str) -> Result<()>;
}

/// External disk-image manipulation tool.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Open an image and read its metadata.
    async fn info(&self, path: &Path) -> Result<DiskInfo>;

    /// Create an image file.
    async fn create(&self, path: &Path, opts: &CreateRawOptions) -> Result<()>;

    /// Point the backing-file reference of `path` at `backing`.
    ///
    /// A safe rebase keeps every block that differs from the new backing file.
    async fn rebase(&self, path: &Path, backing: &Path, safe: bool) -> Result<()>;

    /// Convert `path` to `format` in place.
    async fn convert(&self, path: &Path, format: DiskFormat, compress: bool) -> Result<()>;
}

/// Byte transfer of a remote file into a local path.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetch `url` into `dest`. No retry is performed.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Compute control-plane API used for pool registration.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Register a pool; returns the assigned identifier.
    async fn create_storage(&self, info: &StorageSyncInfo) -> Result<String>;

    /// Update a registered pool.
    async fn update_storage(&self, storage_id: &str, info: &StorageSyncInfo) -> Result<()>;

    /// Update only the used capacity of a registered pool.
    async fn update_storage_used(&self, storage_id: &str, used_mb: u64) -> Result<()>;

    /// Announce that an image is present in a storage cache.
    async fn cache_image(
        &self,
        storagecache_id: &str,
        image_id: &str,
        status: &str,
        path: &Path,
    ) -> Result<()>;
}

/// Image registry client.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Upload an image file with its metadata.
    async fn upload(&self, params: &ImageUploadParams, file: tokio::fs::File, size: u64) -> Result<()>;

    /// Change the status of an image record.
    async fn update_status(&self, image_id: &str, status: &str, reason: &str) -> Result<()>;
}

/// Guest OS identification of a disk image.
#[async_trait]
pub trait OsInspector: Send + Sync {
    async fn inspect(&self, disk_path: &Path, compress: bool) -> Result<OsInfo>;
}

/// Node-level resource pressure policy.
pub trait ResourcePolicy: Send + Sync {
    /// Eviction thresholds, or `None` when the node runs no eviction controller.
    fn eviction(&self) -> Option<EvictionPolicy>;

    /// Device a path is mounted from.
    fn mount_device(&self, path: &Path) -> Result<String>;
}
