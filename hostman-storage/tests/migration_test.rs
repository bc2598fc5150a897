//! End-to-end tests of destination-side migration into a local pool.
//!
//! Collaborators come from `hostman_storage::mock`; the pool lives in a
//! temporary directory.

use std::path::PathBuf;
use std::sync::Arc;

use hostman_storage::mock::{MockComputeApi, MockFetcher, MockImageRegistry, MockImageTool, MockOsInspector};
use hostman_storage::{
    Disk, LocalImageCache, LocalStorageOptions, MigrateRequest, MigrationDescriptor, OsInfo, PoolConfig,
    StorageManager, StorageServices,
};

struct Host {
    _dir: tempfile::TempDir,
    pool: PathBuf,
    image_cache: PathBuf,
    tool: Arc<MockImageTool>,
    fetcher: Arc<MockFetcher>,
    manager: StorageManager,
}

async fn host() -> Host {
    let dir = tempfile::tempdir().unwrap();
    let pool = dir.path().join("data/pool0");
    let image_cache = dir.path().join("imagecache");
    let tool = Arc::new(MockImageTool::new());
    let fetcher = Arc::new(MockFetcher::new());
    tool.write_image(&image_cache.join("tmpl-a"), None).unwrap();

    let services = StorageServices {
        tool: tool.clone(),
        fetcher: fetcher.clone(),
        compute: Arc::new(MockComputeApi::new()),
        registry: Arc::new(MockImageRegistry::new()),
        inspector: Arc::new(MockOsInspector::new(OsInfo::default())),
        policy: None,
        image_cache: Some(Arc::new(LocalImageCache::new(&image_cache, tool.clone()))),
    };
    let manager = StorageManager::new("10.0.0.5", LocalStorageOptions::default(), services);
    manager.add_storage(PoolConfig::new(&pool, 0)).await.unwrap();

    Host {
        _dir: dir,
        pool,
        image_cache,
        tool,
        fetcher,
        manager,
    }
}

fn cold_request() -> MigrateRequest {
    MigrateRequest {
        live_migrate: false,
        disks_uri: "http://src/disks".to_string(),
        snapshots_uri: "http://src/snapshots".to_string(),
        rebase_disks: true,
    }
}

fn descriptor(disk_id: &str, snapshots: &[&str]) -> MigrationDescriptor {
    MigrationDescriptor {
        disk_id: disk_id.to_string(),
        storage_id: "st-src".to_string(),
        size_mb: 10240,
        template_id: Some("tmpl-a".to_string()),
        snapshots: snapshots.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Cold migration of d1 with snapshots s1, s2 onto template tmpl-a.
#[tokio::test]
async fn test_cold_migration_rebuilds_chain() {
    let host = host().await;
    let storage = host.manager.get_storage_by_index(0).await.unwrap();
    let mut desc = descriptor("d1", &["s1", "s2"]);

    storage
        .destination_prepare_migrate(&cold_request(), &mut desc)
        .await
        .unwrap();

    let s1 = host.pool.join("snapshots/d1/s1");
    let s2 = host.pool.join("snapshots/d1/s2");
    let d1 = host.pool.join("d1");
    assert!(s1.is_file());
    assert!(s2.is_file());
    assert!(d1.is_file());
    assert_eq!(desc.path, Some(d1.clone()));

    assert_eq!(host.tool.backing_of(&d1), Some(s2.clone()));
    assert_eq!(host.tool.backing_of(&s2), Some(s1.clone()));
    assert_eq!(host.tool.backing_of(&s1), Some(host.image_cache.join("tmpl-a")));
    assert_eq!(
        host.tool.chain_of(&d1),
        vec![s2, s1, host.image_cache.join("tmpl-a")]
    );

    assert_eq!(
        host.fetcher.fetched(),
        vec![
            "http://src/snapshots/st-src/d1/s1",
            "http://src/snapshots/st-src/d1/s2",
            "http://src/disks/st-src/d1",
        ]
    );

    // The migrated disk is now visible through the pool.
    let disk = storage.get_disk_by_id("d1").await.unwrap();
    assert_eq!(disk.path(), host.pool.join("d1"));
    assert_eq!(disk.info().unwrap().backing_file, Some(host.pool.join("snapshots/d1/s2")));
}

#[tokio::test]
async fn test_concurrent_migrations_into_one_pool() {
    let host = host().await;
    let storage = host.manager.get_storage_by_index(0).await.unwrap();
    let ids: Vec<String> = (0..4).map(|_| uuid::Uuid::new_v4().to_string()).collect();

    let runs = ids.iter().map(|id| {
        let storage = storage.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut desc = descriptor(&id, &["s1"]);
            storage.destination_prepare_migrate(&cold_request(), &mut desc).await?;
            Ok::<_, hostman_storage::StorageError>(desc)
        })
    });

    for run in runs.collect::<Vec<_>>() {
        let desc = run.await.unwrap().unwrap();
        let disk = desc.path.unwrap();
        let s1 = host.pool.join("snapshots").join(&desc.disk_id).join("s1");
        assert_eq!(host.tool.chain_of(&disk), vec![s1, host.image_cache.join("tmpl-a")]);
    }
    assert_eq!(storage.disks().len(), ids.len());
}

#[tokio::test]
async fn test_aborted_migration_is_retryable() {
    let host = host().await;
    let storage = host.manager.get_storage_by_index(0).await.unwrap();
    host.fetcher.fail_times("http://src/disks/st-src/d1", 1);

    let mut desc = descriptor("d1", &["s1"]);
    assert!(storage
        .destination_prepare_migrate(&cold_request(), &mut desc)
        .await
        .is_err());
    assert!(desc.path.is_none());
    assert!(storage.get_disk_by_id("d1").await.is_err());

    storage.delete_snapshots("d1").await.unwrap();
    let mut desc = descriptor("d1", &["s1"]);
    storage
        .destination_prepare_migrate(&cold_request(), &mut desc)
        .await
        .unwrap();
    assert_eq!(
        host.tool.backing_of(&host.pool.join("d1")),
        Some(host.pool.join("snapshots/d1/s1"))
    );
}
