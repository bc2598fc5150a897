//! In-memory collaborators for testing and development.
//!
//! These fakes keep backing-file pointers, transfers and control-plane calls
//! in memory so the storage engine can be exercised without qemu-img, a
//! remote peer or a control plane.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::io::AsyncReadExt;

use crate::error::{Result, StorageError};
use crate::traits::{ComputeApi, ImageRegistry, ImageTool, OsInspector, RemoteFetcher};
use crate::types::{CreateRawOptions, DiskFormat, DiskInfo, ImageUploadParams, OsInfo, StorageSyncInfo};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn tool_failed(msg: impl Into<String>) -> StorageError {
    StorageError::ToolFailed {
        tool: "mock".to_string(),
        stderr: msg.into(),
    }
}

/// Image tool tracking backing pointers and formats in memory.
///
/// Image files are real (so existence checks work) but their content is
/// irrelevant.
#[derive(Default)]
pub struct MockImageTool {
    backing: Mutex<HashMap<PathBuf, PathBuf>>,
    formats: Mutex<HashMap<PathBuf, DiskFormat>>,
    fail_rebase: Mutex<HashSet<PathBuf>>,
    fail_convert: AtomicBool,
    info_calls: AtomicUsize,
}

impl MockImageTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an image file, optionally backed by `backing`.
    pub fn write_image(&self, path: &Path, backing: Option<&Path>) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"mock-image")?;
        let mut map = lock(&self.backing);
        match backing {
            Some(b) => map.insert(path.to_path_buf(), b.to_path_buf()),
            None => map.remove(path),
        };
        Ok(())
    }

    pub fn backing_of(&self, path: &Path) -> Option<PathBuf> {
        lock(&self.backing).get(path).cloned()
    }

    pub fn format_of(&self, path: &Path) -> Option<DiskFormat> {
        lock(&self.formats).get(path).copied()
    }

    /// Walk backing pointers from `path`, stopping at a cycle.
    pub fn chain_of(&self, path: &Path) -> Vec<PathBuf> {
        let map = lock(&self.backing);
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = map.get(path);
        while let Some(next) = cur {
            if !seen.insert(next.clone()) {
                break;
            }
            chain.push(next.clone());
            cur = map.get(next);
        }
        chain
    }

    pub fn fail_rebase_of(&self, path: &Path) {
        lock(&self.fail_rebase).insert(path.to_path_buf());
    }

    pub fn fail_convert(&self) {
        self.fail_convert.store(true, Ordering::SeqCst);
    }

    /// Number of `info` calls so far.
    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageTool for MockImageTool {
    async fn info(&self, path: &Path) -> Result<DiskInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        if !path.is_file() {
            return Err(StorageError::NotFound(format!("disk image {}", path.display())));
        }
        Ok(DiskInfo {
            path: path.to_path_buf(),
            format: self.format_of(path).unwrap_or(DiskFormat::Qcow2).as_str().to_string(),
            virtual_size: 0,
            actual_size: 0,
            backing_file: self.backing_of(path),
        })
    }

    async fn create(&self, path: &Path, opts: &CreateRawOptions) -> Result<()> {
        if path.exists() {
            return Err(StorageError::InvalidConfig(format!(
                "Disk image already exists: {}",
                path.display()
            )));
        }
        if let Some(backing) = &opts.backing_file {
            if !backing.exists() {
                return Err(tool_failed(format!("backing file {} missing", backing.display())));
            }
        }
        self.write_image(path, opts.backing_file.as_deref())
            .map_err(|e| StorageError::io(path, e))?;
        lock(&self.formats).insert(path.to_path_buf(), opts.format);
        Ok(())
    }

    async fn rebase(&self, path: &Path, backing: &Path, _safe: bool) -> Result<()> {
        if lock(&self.fail_rebase).contains(path) {
            return Err(tool_failed(format!("rebase of {} refused", path.display())));
        }
        if !path.exists() || !backing.exists() {
            return Err(tool_failed("image or backing file missing"));
        }
        lock(&self.backing)
            .insert(path.to_path_buf(), backing.to_path_buf());
        Ok(())
    }

    async fn convert(&self, path: &Path, format: DiskFormat, _compress: bool) -> Result<()> {
        if self.fail_convert.load(Ordering::SeqCst) {
            return Err(tool_failed("convert refused"));
        }
        if !path.exists() {
            return Err(StorageError::NotFound(path.display().to_string()));
        }
        lock(&self.formats).insert(path.to_path_buf(), format);
        Ok(())
    }
}

/// Fetcher writing the URL itself as file content.
#[derive(Default)]
pub struct MockFetcher {
    failures: Mutex<HashMap<String, Option<u32>>>,
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every fetch of `url`.
    pub fn fail_url(&self, url: &str) {
        lock(&self.failures).insert(url.to_string(), None);
    }

    /// Fail the next `times` fetches of `url`.
    pub fn fail_times(&self, url: &str, times: u32) {
        lock(&self.failures).insert(url.to_string(), Some(times));
    }

    /// URLs requested so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        lock(&self.fetched).clone()
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.fetched).len()
    }
}

#[async_trait]
impl RemoteFetcher for MockFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        lock(&self.fetched).push(url.to_string());

        let fail = {
            let mut failures = lock(&self.failures);
            match failures.get_mut(url) {
                Some(None) => true,
                Some(Some(0)) | None => false,
                Some(Some(n)) => {
                    *n -= 1;
                    true
                }
            }
        };
        if fail {
            return Err(StorageError::FetchFailed {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        tokio::fs::write(dest, url.as_bytes())
            .await
            .map_err(|e| StorageError::io(dest, e))
    }
}

/// Control-plane fake assigning sequential storage ids.
#[derive(Default)]
pub struct MockComputeApi {
    created: Mutex<Vec<StorageSyncInfo>>,
    updated: Mutex<Vec<(String, StorageSyncInfo)>>,
    used: Mutex<Vec<(String, u64)>>,
    cached: Mutex<Vec<(String, String, String, PathBuf)>>,
    fail: AtomicBool,
}

impl MockComputeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<StorageSyncInfo> {
        lock(&self.created).clone()
    }

    pub fn updated(&self) -> Vec<(String, StorageSyncInfo)> {
        lock(&self.updated).clone()
    }

    pub fn used_updates(&self) -> Vec<(String, u64)> {
        lock(&self.used).clone()
    }

    /// `(storagecache_id, image_id, status, path)` announcements.
    pub fn cached_images(&self) -> Vec<(String, String, String, PathBuf)> {
        lock(&self.cached).clone()
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::ControlPlane("503 Service Unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeApi for MockComputeApi {
    async fn create_storage(&self, info: &StorageSyncInfo) -> Result<String> {
        self.check()?;
        let mut created = lock(&self.created);
        created.push(info.clone());
        Ok(format!("storage-{}", created.len()))
    }

    async fn update_storage(&self, storage_id: &str, info: &StorageSyncInfo) -> Result<()> {
        self.check()?;
        lock(&self.updated)
            .push((storage_id.to_string(), info.clone()));
        Ok(())
    }

    async fn update_storage_used(&self, storage_id: &str, used_mb: u64) -> Result<()> {
        self.check()?;
        lock(&self.used).push((storage_id.to_string(), used_mb));
        Ok(())
    }

    async fn cache_image(
        &self,
        storagecache_id: &str,
        image_id: &str,
        status: &str,
        path: &Path,
    ) -> Result<()> {
        self.check()?;
        lock(&self.cached).push((
            storagecache_id.to_string(),
            image_id.to_string(),
            status.to_string(),
            path.to_path_buf(),
        ));
        Ok(())
    }
}

/// Image registry fake recording uploads and status changes.
#[derive(Default)]
pub struct MockImageRegistry {
    uploads: Mutex<Vec<(ImageUploadParams, u64, Vec<u8>)>>,
    statuses: Mutex<Vec<(String, String, String)>>,
    fail_upload: AtomicBool,
    fail_status: AtomicBool,
}

impl MockImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_upload(&self) {
        self.fail_upload.store(true, Ordering::SeqCst);
    }

    pub fn fail_status(&self) {
        self.fail_status.store(true, Ordering::SeqCst);
    }

    /// `(params, declared size, body)` of each upload.
    pub fn uploads(&self) -> Vec<(ImageUploadParams, u64, Vec<u8>)> {
        lock(&self.uploads).clone()
    }

    /// `(image_id, status, reason)` of each status change.
    pub fn statuses(&self) -> Vec<(String, String, String)> {
        lock(&self.statuses).clone()
    }
}

#[async_trait]
impl ImageRegistry for MockImageRegistry {
    async fn upload(&self, params: &ImageUploadParams, mut file: tokio::fs::File, size: u64) -> Result<()> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(StorageError::UploadFailed("registry unavailable".to_string()));
        }
        let mut body = Vec::new();
        file.read_to_end(&mut body)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        lock(&self.uploads).push((params.clone(), size, body));
        Ok(())
    }

    async fn update_status(&self, image_id: &str, status: &str, reason: &str) -> Result<()> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(StorageError::ControlPlane("registry unavailable".to_string()));
        }
        lock(&self.statuses).push((
            image_id.to_string(),
            status.to_string(),
            reason.to_string(),
        ));
        Ok(())
    }
}

/// OS inspector returning a fixed answer.
#[derive(Default)]
pub struct MockOsInspector {
    info: OsInfo,
    fail: AtomicBool,
}

impl MockOsInspector {
    pub fn new(info: OsInfo) -> Self {
        Self {
            info,
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OsInspector for MockOsInspector {
    async fn inspect(&self, disk_path: &Path, _compress: bool) -> Result<OsInfo> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Internal(format!(
                "cannot inspect {}",
                disk_path.display()
            )));
        }
        Ok(self.info.clone())
    }
}
