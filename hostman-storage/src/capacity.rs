//! Pool capacity accounting.
//!
//! Free space reported for a pool is reduced by the share the node's eviction
//! controller would reclaim when the pool sits on a monitored device.

use std::path::Path;
use tokio::process::Command;
use tracing::{error, info};

use crate::error::{Result, StorageError};
use crate::traits::ResourcePolicy;
use crate::types::FsStats;

/// Hard eviction thresholds of the node, as fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvictionPolicy {
    /// `nodefs.available` floor
    pub node_fs_available: f64,
    /// `imagefs.available` floor
    pub image_fs_available: f64,
    /// Image filesystem lives on its own device
    pub dedicated_image_fs: bool,
    pub node_fs_device: String,
    pub image_fs_device: String,
}

impl EvictionPolicy {
    /// Share of a pool's free space that may be advertised.
    pub fn usable_fraction(&self, storage_dev: &str) -> f64 {
        let image_fs = clamp_fraction(self.image_fs_available);
        let node_fs = clamp_fraction(self.node_fs_available);

        if self.dedicated_image_fs {
            if storage_dev == self.image_fs_device {
                return 1.0 - image_fs;
            }
        } else if storage_dev == self.node_fs_device {
            return 1.0 - node_fs.max(image_fs);
        }
        1.0
    }
}

fn clamp_fraction(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Scale `raw_mb` by the usable fraction of the pool device.
pub fn apply_eviction(raw_mb: u64, policy: &EvictionPolicy, storage_dev: &str) -> u64 {
    (raw_mb as f64 * policy.usable_fraction(storage_dev)) as u64
}

/// Available capacity of the pool at `path` in MiB.
///
/// Returns `raw_mb` unchanged when there is no eviction policy or the pool
/// device cannot be resolved.
pub fn available_capacity_mb(raw_mb: u64, policy: Option<&dyn ResourcePolicy>, path: &Path) -> u64 {
    let Some(source) = policy else {
        return raw_mb;
    };
    let Some(eviction) = source.eviction() else {
        return raw_mb;
    };

    let storage_dev = match source.mount_device(path) {
        Ok(dev) => dev,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to get directory mount device");
            return raw_mb;
        }
    };

    let fraction = eviction.usable_fraction(&storage_dev);
    let size_mb = apply_eviction(raw_mb, &eviction, &storage_dev);
    info!(
        path = %path.display(),
        device = %storage_dev,
        size_mb,
        usable_percent = fraction,
        "Storage capacity adjusted for eviction thresholds"
    );
    size_mb
}

/// Get filesystem stats for a path.
pub async fn fs_stats(path: &Path) -> Result<FsStats> {
    let output = Command::new("df")
        .arg("--output=size,used,avail")
        .arg("-B1")
        .arg(path)
        .output()
        .await
        .map_err(|e| StorageError::Internal(format!("df command failed: {}", e)))?;

    if !output.status.success() {
        return Err(StorageError::ToolFailed {
            tool: "df".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_df_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_df_output(stdout: &str) -> Result<FsStats> {
    let line = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| StorageError::Internal("Unexpected df output".into()))?;

    let parts: Vec<u64> = line
        .split_whitespace()
        .map(|p| p.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| StorageError::Internal(format!("Unexpected df output format: {}", e)))?;

    match parts.as_slice() {
        [total, used, avail] => Ok(FsStats {
            total_bytes: *total,
            used_bytes: *used,
            available_bytes: *avail,
        }),
        _ => Err(StorageError::Internal("Unexpected df output format".into())),
    }
}
