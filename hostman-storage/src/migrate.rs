//! Destination side of disk migration.
//!
//! A run rebuilds one disk and its snapshot chain on this host:
//!
//! ```text
//! create handle ─► snapshot dir ─► fetch s1 ─► rebase s1 → template
//!                                  fetch s2 ─► rebase s2 → s1
//!                                  ...
//!               ─► disk (overlay | download) ─► rebase disk → head
//! ```
//!
//! Steps run strictly in order and the first failure aborts the run. Files
//! already fetched are left in place for the caller's cleanup.

use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::cache::DiskCache;
use crate::error::{Result, StorageError};
use crate::image_cache::template_path_in;
use crate::rebase::rebase_disk;
use crate::snapshot::{disk_url, fetch_snapshot, snapshot_url};
use crate::traits::{ImageTool, RemoteFetcher};
use crate::types::{CreateRawOptions, DiskFormat, MigrateRequest, MigrationDescriptor};

/// Cold migrations download the disk once; retrying is up to the task layer.
const DISK_DOWNLOAD_RETRIES: u32 = 0;

/// Rebuilds migrated disks inside one pool.
pub struct MigrationPreparer<'a> {
    cache: &'a DiskCache,
    tool: &'a dyn ImageTool,
    fetcher: &'a dyn RemoteFetcher,
    image_cache_path: Option<PathBuf>,
}

impl<'a> MigrationPreparer<'a> {
    pub fn new(cache: &'a DiskCache, tool: &'a dyn ImageTool, fetcher: &'a dyn RemoteFetcher) -> Self {
        Self {
            cache,
            tool,
            fetcher,
            image_cache_path: None,
        }
    }

    /// Resolve template and backing ids inside `path`.
    pub fn with_image_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_cache_path = Some(path.into());
        self
    }

    fn resolve_image(&self, id: &str) -> Result<PathBuf> {
        match &self.image_cache_path {
            Some(cache) => Ok(template_path_in(cache, id)),
            None if Path::new(id).is_absolute() => Ok(PathBuf::from(id)),
            None => Err(StorageError::InvalidConfig(format!(
                "image {} requested but this host has no image cache",
                id
            ))),
        }
    }

    /// Rebuild the disk described by `desc` and publish its local path.
    #[instrument(skip(self, req, desc), fields(disk_id = %desc.disk_id, live = req.live_migrate))]
    pub async fn prepare(&self, req: &MigrateRequest, desc: &mut MigrationDescriptor) -> Result<()> {
        let disk = self.cache.create(&desc.disk_id)?;
        let template = desc
            .template_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| self.resolve_image(t))
            .transpose()?;

        let snapshot_dir = disk.snapshot_dir();
        if !desc.snapshots.is_empty() {
            tokio::fs::create_dir_all(&snapshot_dir)
                .await
                .map_err(|e| StorageError::io(&snapshot_dir, e))?;
        }

        let mut chain_head: Option<PathBuf> = None;
        for (i, snapshot_id) in desc.snapshots.iter().enumerate() {
            let url = snapshot_url(&req.snapshots_uri, &desc.storage_id, &desc.disk_id, snapshot_id);
            let snapshot_path = snapshot_dir.join(snapshot_id);
            info!(snapshot_id = %snapshot_id, url = %url, "Replaying snapshot");
            fetch_snapshot(self.fetcher, &url, &snapshot_path).await?;

            match (&template, &chain_head) {
                (Some(tmpl), _) if i == 0 => rebase_disk(self.tool, &snapshot_path, tmpl).await?,
                (_, Some(prev)) if req.rebase_disks => rebase_disk(self.tool, &snapshot_path, prev).await?,
                _ => {}
            }
            chain_head = Some(snapshot_path);
        }

        if req.live_migrate {
            let mut opts = CreateRawOptions::new(desc.size_mb, DiskFormat::Qcow2);
            if let Some(backing) = desc.backing_file.as_deref().filter(|b| !b.is_empty()) {
                opts = opts.with_backing_file(self.resolve_image(backing)?);
            }
            disk.create_raw(&opts).await?;
        } else {
            let url = disk_url(&req.disks_uri, &desc.storage_id, &desc.disk_id);
            disk.create_from_url(&url, DISK_DOWNLOAD_RETRIES).await?;
        }

        if req.rebase_disks {
            match (&chain_head, &template) {
                (Some(head), _) => rebase_disk(self.tool, &disk.path(), head).await?,
                (None, Some(tmpl)) => rebase_disk(self.tool, &disk.path(), tmpl).await?,
                (None, None) => {}
            }
        }

        desc.path = Some(disk.path());
        info!(path = %disk.path().display(), snapshots = desc.snapshots.len(), "Migrated disk prepared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{LocalDisk, LocalDiskEnv};
    use crate::mock::{MockFetcher, MockImageTool};
    use crate::traits::Disk;
    use crate::types::LocalStorageOptions;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: PathBuf,
        image_cache: PathBuf,
        tool: Arc<MockImageTool>,
        fetcher: Arc<MockFetcher>,
        cache: DiskCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = dir.path().join("pool0");
        let image_cache = dir.path().join("imagecache");
        let tool = Arc::new(MockImageTool::new());
        let fetcher = Arc::new(MockFetcher::new());
        tool.write_image(&image_cache.join("tmpl-a"), None).unwrap();

        let env = LocalDiskEnv {
            pool_path: pool.clone(),
            options: LocalStorageOptions::default(),
            tool: tool.clone(),
            fetcher: fetcher.clone(),
        };
        let cache = DiskCache::new(move |id| Arc::new(LocalDisk::new(env.clone(), id)) as Arc<dyn Disk>);
        Fixture {
            _dir: dir,
            pool,
            image_cache,
            tool,
            fetcher,
            cache,
        }
    }

    fn cold(rebase_disks: bool) -> MigrateRequest {
        MigrateRequest {
            live_migrate: false,
            disks_uri: "http://src/disks".to_string(),
            snapshots_uri: "http://src/snapshots".to_string(),
            rebase_disks,
        }
    }

    fn descriptor(snapshots: &[&str]) -> MigrationDescriptor {
        MigrationDescriptor {
            disk_id: "d1".to_string(),
            storage_id: "st-1".to_string(),
            size_mb: 10240,
            template_id: Some("tmpl-a".to_string()),
            snapshots: snapshots.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn replay(f: &Fixture, req: &MigrateRequest, desc: &mut MigrationDescriptor) -> Result<()> {
        MigrationPreparer::new(&f.cache, f.tool.as_ref(), f.fetcher.as_ref())
            .with_image_cache(&f.image_cache)
            .prepare(req, desc)
            .await
    }

    #[tokio::test]
    async fn test_chain_is_rebased_in_order() {
        let f = fixture();
        let mut desc = descriptor(&["s1", "s2", "s3"]);
        replay(&f, &cold(true), &mut desc).await.unwrap();

        let snaps = f.pool.join("snapshots").join("d1");
        let disk = f.pool.join("d1");
        assert_eq!(desc.path.as_deref(), Some(disk.as_path()));
        assert_eq!(
            f.tool.chain_of(&disk),
            vec![snaps.join("s3"), snaps.join("s2"), snaps.join("s1"), f.image_cache.join("tmpl-a")]
        );
        assert_eq!(
            f.fetcher.fetched(),
            vec![
                "http://src/snapshots/st-1/d1/s1",
                "http://src/snapshots/st-1/d1/s2",
                "http://src/snapshots/st-1/d1/s3",
                "http://src/disks/st-1/d1",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_earlier_links() {
        let f = fixture();
        f.fetcher.fail_url("http://src/snapshots/st-1/d1/s2");
        let mut desc = descriptor(&["s1", "s2"]);

        let err = replay(&f, &cold(true), &mut desc).await.unwrap_err();
        assert!(matches!(err, StorageError::FetchFailed { .. }));

        let s1 = f.pool.join("snapshots").join("d1").join("s1");
        assert_eq!(f.tool.backing_of(&s1), Some(f.image_cache.join("tmpl-a")));
        assert!(!f.pool.join("d1").exists());
        assert!(desc.path.is_none());
    }

    #[tokio::test]
    async fn test_without_rebase_only_first_snapshot_binds_template() {
        let f = fixture();
        let mut desc = descriptor(&["s1", "s2"]);
        replay(&f, &cold(false), &mut desc).await.unwrap();

        let snaps = f.pool.join("snapshots").join("d1");
        assert_eq!(f.tool.backing_of(&snaps.join("s1")), Some(f.image_cache.join("tmpl-a")));
        assert_eq!(f.tool.backing_of(&snaps.join("s2")), None);
        assert_eq!(f.tool.backing_of(&f.pool.join("d1")), None);
    }

    #[tokio::test]
    async fn test_no_snapshots_rebases_disk_onto_template() {
        let f = fixture();
        let mut desc = descriptor(&[]);
        replay(&f, &cold(true), &mut desc).await.unwrap();

        assert!(!f.pool.join("snapshots").join("d1").exists());
        assert_eq!(f.tool.backing_of(&f.pool.join("d1")), Some(f.image_cache.join("tmpl-a")));
    }

    #[tokio::test]
    async fn test_live_migration_creates_overlay() {
        let f = fixture();
        let mut desc = descriptor(&[]);
        desc.template_id = None;
        desc.backing_file = Some("tmpl-a".to_string());
        let mut req = cold(false);
        req.live_migrate = true;

        replay(&f, &req, &mut desc).await.unwrap();

        let disk = f.pool.join("d1");
        assert_eq!(f.tool.backing_of(&disk), Some(f.image_cache.join("tmpl-a")));
        assert_eq!(f.tool.format_of(&disk), Some(DiskFormat::Qcow2));
        assert_eq!(f.fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_rebase_failure_aborts() {
        let f = fixture();
        let s2 = f.pool.join("snapshots").join("d1").join("s2");
        f.tool.fail_rebase_of(&s2);
        let mut desc = descriptor(&["s1", "s2"]);

        let err = replay(&f, &cold(true), &mut desc).await.unwrap_err();
        assert!(matches!(err, StorageError::RebaseFailed { .. }));
        assert_eq!(f.fetcher.fetch_count(), 2);
    }
}
