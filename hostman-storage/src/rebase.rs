//! Backing-chain rebasing.

use std::path::Path;
use tracing::info;

use crate::error::{Result, StorageError};
use crate::traits::ImageTool;

/// Point the backing file of `disk_path` at `new_backing`, keeping overlay data.
///
/// On failure the image keeps its previous backing file.
pub async fn rebase_disk(tool: &dyn ImageTool, disk_path: &Path, new_backing: &Path) -> Result<()> {
    let failed = |reason: String| StorageError::RebaseFailed {
        disk: disk_path.to_path_buf(),
        backing: new_backing.to_path_buf(),
        reason,
    };

    tool.info(disk_path)
        .await
        .map_err(|e| failed(format!("failed to open disk as image: {}", e)))?;

    tool.rebase(disk_path, new_backing, true)
        .await
        .map_err(|e| failed(format!("failed to rebase disk backing file: {}", e)))?;

    info!(
        disk = %disk_path.display(),
        backing = %new_backing.display(),
        "Rebased disk backing file"
    );
    Ok(())
}
