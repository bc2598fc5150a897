//! Local file-backed disk.
//!
//! Layout inside the pool root:
//!
//! ```text
//! {pool}/
//!   {disk_id}                         disk image
//!   snapshots/{disk_id}{suffix}/{id}  snapshot layers
//!   fusemnt/{disk_id}/data            remote image exposed by fetcherfs
//!   fusetmp/                          fetcherfs block cache
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::traits::{Disk, ImageTool, RemoteFetcher};
use crate::types::{CreateRawOptions, DiskFormat, DiskInfo, LocalStorageOptions};

pub(crate) const SNAPSHOT_DIR: &str = "snapshots";
pub(crate) const FUSE_MOUNT_DIR: &str = "fusemnt";
pub(crate) const FUSE_TMP_DIR: &str = "fusetmp";

/// Everything a disk handle needs from its pool.
#[derive(Clone)]
pub struct LocalDiskEnv {
    pub pool_path: PathBuf,
    pub options: LocalStorageOptions,
    pub tool: Arc<dyn ImageTool>,
    pub fetcher: Arc<dyn RemoteFetcher>,
}

/// A disk image file at the top level of a local pool.
pub struct LocalDisk {
    id: String,
    env: LocalDiskEnv,
    info: Mutex<Option<DiskInfo>>,
}

impl LocalDisk {
    pub fn new(env: LocalDiskEnv, id: &str) -> Self {
        Self {
            id: id.to_string(),
            env,
            info: Mutex::new(None),
        }
    }

    fn fuse_mount_point(&self) -> PathBuf {
        self.env.pool_path.join(FUSE_MOUNT_DIR).join(&self.id)
    }

    fn set_info(&self, info: Option<DiskInfo>) {
        if let Ok(mut slot) = self.info.lock() {
            *slot = info;
        }
    }

    async fn ensure_dir(path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn format_filesystem(&self, fs: &str) -> Result<()> {
        let force = if fs == "xfs" { "-f" } else { "-F" };
        let tool = format!("mkfs.{}", fs);
        let output = Command::new(&tool)
            .arg(force)
            .arg(self.path())
            .output()
            .await
            .map_err(|e| StorageError::Internal(format!("Failed to execute {}: {}", tool, e)))?;

        if !output.status.success() {
            return Err(StorageError::ToolFailed {
                tool,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(disk_id = %self.id, fs = %fs, "Formatted disk filesystem");
        Ok(())
    }
}

#[async_trait]
impl Disk for LocalDisk {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> PathBuf {
        self.env.pool_path.join(&self.id)
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.env
            .pool_path
            .join(SNAPSHOT_DIR)
            .join(format!("{}{}", self.id, self.env.options.snapshot_dir_suffix))
    }

    async fn probe(&self) -> Result<()> {
        match self.env.tool.info(&self.path()).await {
            Ok(info) => {
                self.set_info(Some(info));
                Ok(())
            }
            Err(e) => {
                self.set_info(None);
                Err(StorageError::NotFound(format!("disk {}: {}", self.id, e)))
            }
        }
    }

    fn info(&self) -> Option<DiskInfo> {
        self.info.lock().ok().and_then(|i| i.clone())
    }

    #[instrument(skip(self, opts), fields(disk_id = %self.id, size_mb = opts.size_mb, format = %opts.format))]
    async fn create_raw(&self, opts: &CreateRawOptions) -> Result<DiskInfo> {
        if opts.fs_format.is_some() && opts.format != DiskFormat::Raw {
            return Err(StorageError::InvalidConfig(format!(
                "filesystem formatting requires a raw image, got {}",
                opts.format
            )));
        }

        Self::ensure_dir(&self.env.pool_path).await?;
        self.env.tool.create(&self.path(), opts).await?;

        if let Some(fs) = &opts.fs_format {
            self.format_filesystem(fs).await?;
        }

        self.probe().await?;
        self.info()
            .ok_or_else(|| StorageError::Internal(format!("disk {} lost its info", self.id)))
    }

    #[instrument(skip(self), fields(disk_id = %self.id))]
    async fn create_from_url(&self, url: &str, retries: u32) -> Result<()> {
        Self::ensure_dir(&self.env.pool_path).await?;

        let mut attempt = 0;
        loop {
            match self.env.fetcher.fetch(url, &self.path()).await {
                Ok(()) => break,
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(url = %url, attempt, error = %e, "Disk download failed, retrying");
                }
                Err(e) => {
                    return Err(match e {
                        StorageError::FetchFailed { .. } => e,
                        other => StorageError::FetchFailed {
                            url: url.to_string(),
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }

        info!(url = %url, path = %self.path().display(), "Disk downloaded");
        self.probe().await
    }

    #[instrument(skip(self), fields(disk_id = %self.id, size_mb))]
    async fn create_from_image_fuse(&self, url: &str, size_mb: u64) -> Result<()> {
        let mount_point = self.fuse_mount_point();
        let tmp_dir = self.env.pool_path.join(FUSE_TMP_DIR);
        Self::ensure_dir(&mount_point).await?;
        Self::ensure_dir(&tmp_dir).await?;

        debug!(url = %url, mount_point = %mount_point.display(), "Mounting remote image");
        let output = Command::new(&self.env.options.fetcherfs_path)
            .arg(format!("--url={}", url))
            .arg(format!("--tmpdir={}", tmp_dir.display()))
            .arg(format!("--blocksize={}", self.env.options.fetcherfs_block_size_mb))
            .arg(format!("--mountpoint={}", mount_point.display()))
            .output()
            .await
            .map_err(|e| StorageError::Internal(format!("Failed to execute fetcherfs: {}", e)))?;

        if !output.status.success() {
            return Err(StorageError::ToolFailed {
                tool: "fetcherfs".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let data = mount_point.join("data");
        if !data.exists() {
            return Err(StorageError::FetchFailed {
                url: url.to_string(),
                reason: format!("fuse mount {} has no data file", mount_point.display()),
            });
        }

        let opts = CreateRawOptions::new(size_mb, DiskFormat::Qcow2).with_backing_file(data);
        self.env.tool.create(&self.path(), &opts).await?;
        info!(url = %url, "Disk created over fuse-mounted image");
        self.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFetcher, MockImageTool};

    fn env(root: &Path, tool: Arc<MockImageTool>, fetcher: Arc<MockFetcher>) -> LocalDiskEnv {
        LocalDiskEnv {
            pool_path: root.to_path_buf(),
            options: LocalStorageOptions::default(),
            tool,
            fetcher,
        }
    }

    #[test]
    fn test_disk_paths() {
        let mut e = env(
            Path::new("/data/pool0"),
            Arc::new(MockImageTool::new()),
            Arc::new(MockFetcher::new()),
        );
        e.options.snapshot_dir_suffix = "_snap".to_string();
        let disk = LocalDisk::new(e, "d1");
        assert_eq!(disk.path(), PathBuf::from("/data/pool0/d1"));
        assert_eq!(disk.snapshot_dir(), PathBuf::from("/data/pool0/snapshots/d1_snap"));
        assert_eq!(disk.fuse_mount_point(), PathBuf::from("/data/pool0/fusemnt/d1"));
    }

    #[tokio::test]
    async fn test_create_raw_with_backing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockImageTool::new());
        let base = dir.path().join("base");
        tool.write_image(&base, None).unwrap();
        let disk = LocalDisk::new(env(dir.path(), tool.clone(), Arc::new(MockFetcher::new())), "d1");

        let opts = CreateRawOptions::new(2048, DiskFormat::Qcow2).with_backing_file(&base);
        let info = disk.create_raw(&opts).await.unwrap();
        assert_eq!(info.backing_file, Some(base.clone()));
        assert_eq!(tool.backing_of(&disk.path()), Some(base));
    }

    #[tokio::test]
    async fn test_fs_format_requires_raw() {
        let dir = tempfile::tempdir().unwrap();
        let disk = LocalDisk::new(
            env(dir.path(), Arc::new(MockImageTool::new()), Arc::new(MockFetcher::new())),
            "d1",
        );
        let mut opts = CreateRawOptions::new(1024, DiskFormat::Qcow2);
        opts.fs_format = Some("ext4".to_string());

        let err = disk.create_raw(&opts).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
        assert!(!disk.path().exists());
    }

    #[tokio::test]
    async fn test_create_from_url_retries() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.fail_times("http://src/disks/st/d1", 2);
        let disk = LocalDisk::new(env(dir.path(), Arc::new(MockImageTool::new()), fetcher.clone()), "d1");

        assert!(disk.create_from_url("http://src/disks/st/d1", 1).await.is_err());
        assert_eq!(fetcher.fetch_count(), 2);

        disk.create_from_url("http://src/disks/st/d1", 1).await.unwrap();
        assert!(disk.path().exists());
        assert!(disk.info().is_some());
    }
}
