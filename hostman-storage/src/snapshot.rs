//! Snapshot transfer from a remote peer.

use std::path::Path;
use tracing::{error, info};

use crate::error::{Result, StorageError};
use crate::traits::RemoteFetcher;

/// Fetch one snapshot file from `url` into `dest`.
///
/// No retry is performed; any transport or verification error becomes
/// `FetchFailed` carrying the source URL.
pub async fn fetch_snapshot(fetcher: &dyn RemoteFetcher, url: &str, dest: &Path) -> Result<()> {
    info!(url = %url, dest = %dest.display(), "Fetching snapshot");

    fetcher.fetch(url, dest).await.map_err(|e| {
        error!(url = %url, error = %e, "Snapshot fetch failed");
        match e {
            StorageError::FetchFailed { .. } => e,
            other => StorageError::FetchFailed {
                url: url.to_string(),
                reason: other.to_string(),
            },
        }
    })
}

/// URL of a snapshot on the source host's transfer endpoint.
pub fn snapshot_url(snapshots_uri: &str, storage_id: &str, disk_id: &str, snapshot_id: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        snapshots_uri.trim_end_matches('/'),
        storage_id,
        disk_id,
        snapshot_id
    )
}

/// URL of a disk on the source host's transfer endpoint.
pub fn disk_url(disks_uri: &str, storage_id: &str, disk_id: &str) -> String {
    format!("{}/{}/{}", disks_uri.trim_end_matches('/'), storage_id, disk_id)
}
