//! Pool root accessibility probe.
//!
//! The probe runs on its own thread. A caller waits at most
//! [`ACCESSIBLE_TIMEOUT`]; a probe stuck in the filesystem is abandoned, not
//! cancelled, and its late result is discarded.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{Result, StorageError};

/// Deadline of one accessibility probe.
pub const ACCESSIBLE_TIMEOUT: Duration = Duration::from_secs(10);

const PROBE_PREFIX: &str = ".hostman-probe";

/// Check that `path` exists (creating it if absent), is a directory and is writable.
pub async fn check_accessible(path: &Path) -> Result<()> {
    check_accessible_within(path, ACCESSIBLE_TIMEOUT).await
}

/// [`check_accessible`] with an explicit deadline.
pub async fn check_accessible_within(path: &Path, deadline: Duration) -> Result<()> {
    let target = path.to_path_buf();
    run_with_deadline(path, deadline, move || probe_path(&target)).await
}

async fn run_with_deadline<F>(path: &Path, deadline: Duration, probe: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("storage-probe".to_string())
        .spawn(move || {
            // The receiver is gone once the caller gave up.
            let _ = tx.send(probe());
        })
        .map_err(|e| StorageError::Internal(format!("Failed to spawn storage probe: {}", e)))?;

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(StorageError::Internal("Storage probe exited without a result".into())),
        Err(_) => {
            warn!(path = %path.display(), deadline_ms = deadline.as_millis() as u64, "Storage probe timed out");
            Err(StorageError::Timeout(path.to_path_buf()))
        }
    }
}

fn probe_path(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::io(path, e))?;
        info!(path = %path.display(), "Created storage directory");
    }

    let meta = std::fs::metadata(path).map_err(|e| StorageError::io(path, e))?;
    if !meta.is_dir() {
        return Err(StorageError::NotADirectory(path.to_path_buf()));
    }

    tempfile::Builder::new()
        .prefix(PROBE_PREFIX)
        .tempfile_in(path)
        .map_err(|_| StorageError::NotWritable(PathBuf::from(path)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_accessible_dir() {
        let dir = tempfile::tempdir().unwrap();
        check_accessible(dir.path()).await.unwrap();
        // Probe file is cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_root_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("a/b/pool0");
        check_accessible(&root).await.unwrap();
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_file_root_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pool0");
        std::fs::write(&file, b"x").unwrap();

        let err = check_accessible(&file).await.unwrap_err();
        assert!(matches!(err, StorageError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_hung_probe_times_out() {
        let started = Instant::now();
        let err = run_with_deadline(Path::new("/data/pool0"), Duration::from_millis(100), || {
            std::thread::sleep(Duration::from_secs(5));
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_probe_error_is_passed_through() {
        let err = run_with_deadline(Path::new("/p"), Duration::from_secs(1), || {
            Err(StorageError::NotWritable(PathBuf::from("/p")))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::NotWritable(_)));
    }
}
