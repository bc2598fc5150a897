//! Kubelet-backed node resource policy.
//!
//! Hosts that also run a kubelet reclaim disk once free space drops under the
//! `evictionHard` floors. The policy resolves which devices those floors
//! apply to so pools sharing them can under-report their capacity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::capacity::EvictionPolicy;
use crate::error::{Result, StorageError};
use crate::traits::ResourcePolicy;

const NODE_FS_AVAILABLE: &str = "nodefs.available";
const IMAGE_FS_AVAILABLE: &str = "imagefs.available";

/// Where to find the kubelet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeletOptions {
    pub enabled: bool,
    /// KubeletConfiguration YAML
    pub config_path: PathBuf,
    /// Kubelet root directory, located on the node filesystem
    pub root_dir: PathBuf,
    /// Container runtime root, located on the image filesystem
    pub image_fs_dir: PathBuf,
}

impl Default for KubeletOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            config_path: PathBuf::from("/var/lib/kubelet/config.yaml"),
            root_dir: PathBuf::from("/var/lib/kubelet"),
            image_fs_dir: PathBuf::from("/var/lib/containerd"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    #[serde(default)]
    eviction_hard: HashMap<String, String>,
}

/// A mounted filesystem: source device and mount point.
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
}

impl MountEntry {
    pub fn new(device: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            mount_point: mount_point.into(),
        }
    }
}

/// Resource policy derived from a kubelet configuration.
#[derive(Debug, Clone)]
pub struct KubeletPolicy {
    eviction: Option<EvictionPolicy>,
    mounts: Vec<MountEntry>,
}

impl KubeletPolicy {
    /// Policy for a node without a kubelet.
    pub fn disabled() -> Self {
        Self {
            eviction: None,
            mounts: Vec::new(),
        }
    }

    /// Load the kubelet configuration and the mount table.
    pub fn load(opts: &KubeletOptions) -> Result<Self> {
        if !opts.enabled {
            return Ok(Self::disabled());
        }

        let config = match std::fs::read_to_string(&opts.config_path) {
            Ok(config) => config,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(config = %opts.config_path.display(), "Kubelet config absent, no eviction policy");
                return Ok(Self::disabled());
            }
            Err(e) => return Err(StorageError::io(&opts.config_path, e)),
        };
        let policy = Self::from_parts(&config, system_mounts(), &opts.root_dir, &opts.image_fs_dir)?;
        info!(
            config = %opts.config_path.display(),
            eviction = ?policy.eviction,
            "Loaded kubelet eviction policy"
        );
        Ok(policy)
    }

    /// Build a policy from kubelet config text and a mount list.
    pub fn from_parts(config_yaml: &str, mounts: Vec<MountEntry>, root_dir: &Path, image_fs_dir: &Path) -> Result<Self> {
        let config: KubeletConfiguration = serde_yaml::from_str(config_yaml)
            .map_err(|e| StorageError::InvalidConfig(format!("Failed to parse kubelet config: {}", e)))?;

        let node_fs_device = resolve_device(&mounts, &canonical_or_raw(root_dir)).unwrap_or_default();
        let image_fs_device = resolve_device(&mounts, &canonical_or_raw(image_fs_dir)).unwrap_or_default();
        debug!(
            node_fs_device = %node_fs_device,
            image_fs_device = %image_fs_device,
            "Resolved kubelet filesystems"
        );

        let threshold = |key: &str| {
            config
                .eviction_hard
                .get(key)
                .map(|v| parse_percentage(v))
                .unwrap_or(0.0)
        };

        let eviction = EvictionPolicy {
            node_fs_available: threshold(NODE_FS_AVAILABLE),
            image_fs_available: threshold(IMAGE_FS_AVAILABLE),
            dedicated_image_fs: node_fs_device != image_fs_device,
            node_fs_device,
            image_fs_device,
        };

        Ok(Self {
            eviction: Some(eviction),
            mounts,
        })
    }
}

impl ResourcePolicy for KubeletPolicy {
    fn eviction(&self) -> Option<EvictionPolicy> {
        self.eviction.clone()
    }

    fn mount_device(&self, path: &Path) -> Result<String> {
        let path = canonical_or_raw(path);
        resolve_device(&self.mounts, &path)
            .ok_or_else(|| StorageError::NotFound(format!("mount device of {}", path.display())))
    }
}

/// Parse a `"10%"` style threshold into a fraction.
///
/// Quantity thresholds such as `"100Mi"` count as no floor.
fn parse_percentage(value: &str) -> f64 {
    match value.trim().strip_suffix('%') {
        Some(pct) => match pct.trim().parse::<f64>() {
            Ok(v) => v / 100.0,
            Err(_) => {
                warn!(value = %value, "Invalid eviction percentage");
                0.0
            }
        },
        None => {
            debug!(value = %value, "Non-percentage eviction threshold ignored");
            0.0
        }
    }
}

/// Mounted filesystems as reported by the host.
fn system_mounts() -> Vec<MountEntry> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .map(|disk| MountEntry::new(disk.name().to_string_lossy(), disk.mount_point()))
        .collect()
}

/// Symlinks resolved, or the path itself when it cannot be.
fn canonical_or_raw(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Device of the mount with the longest mount point containing `path`.
///
/// Later entries win ties so over-mounts shadow what they cover.
fn resolve_device(mounts: &[MountEntry], path: &Path) -> Option<String> {
    mounts
        .iter()
        .enumerate()
        .filter(|(_, m)| path.starts_with(&m.mount_point))
        .max_by_key(|(i, m)| (m.mount_point.components().count(), *i))
        .map(|(_, m)| m.device.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts() -> Vec<MountEntry> {
        vec![
            MountEntry::new("/dev/sda1", "/"),
            MountEntry::new("/dev/sdb1", "/var/lib/containerd"),
            MountEntry::new("/dev/sdc1", "/data/pool 0"),
        ]
    }

    const CONFIG: &str = r#"
apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
evictionHard:
  nodefs.available: "10%"
  imagefs.available: "15%"
  memory.available: "100Mi"
"#;

    #[test]
    fn test_parse_percentage() {
        assert!((parse_percentage("10%") - 0.10).abs() < 1e-9);
        assert!((parse_percentage(" 7.5% ") - 0.075).abs() < 1e-9);
        assert_eq!(parse_percentage("100Mi"), 0.0);
        assert_eq!(parse_percentage("abc%"), 0.0);
    }

    #[test]
    fn test_resolve_longest_prefix() {
        let mounts = mounts();
        assert_eq!(
            resolve_device(&mounts, Path::new("/var/lib/containerd/io.containerd")).as_deref(),
            Some("/dev/sdb1")
        );
        assert_eq!(
            resolve_device(&mounts, Path::new("/var/lib/kubelet")).as_deref(),
            Some("/dev/sda1")
        );
        assert_eq!(
            resolve_device(&mounts, Path::new("/data/pool 0/disk")).as_deref(),
            Some("/dev/sdc1")
        );
    }

    #[test]
    fn test_dedicated_image_fs_detected() {
        let policy = KubeletPolicy::from_parts(
            CONFIG,
            mounts(),
            Path::new("/var/lib/kubelet"),
            Path::new("/var/lib/containerd"),
        )
        .unwrap();
        let eviction = policy.eviction().unwrap();
        assert!(eviction.dedicated_image_fs);
        assert_eq!(eviction.node_fs_device, "/dev/sda1");
        assert_eq!(eviction.image_fs_device, "/dev/sdb1");
        assert!((eviction.image_fs_available - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_shared_image_fs() {
        let policy = KubeletPolicy::from_parts(
            CONFIG,
            mounts(),
            Path::new("/var/lib/kubelet"),
            Path::new("/var/lib/docker"),
        )
        .unwrap();
        let eviction = policy.eviction().unwrap();
        assert!(!eviction.dedicated_image_fs);
        assert!((eviction.usable_fraction("/dev/sda1") - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_symlinked_kubelet_root_resolves_real_device() {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let data = base.join("data");
        std::fs::create_dir_all(data.join("kubelet")).unwrap();
        std::fs::create_dir_all(data.join("containerd")).unwrap();
        std::fs::create_dir_all(data.join("pool")).unwrap();
        let link = base.join("kubelet");
        std::os::unix::fs::symlink(data.join("kubelet"), &link).unwrap();

        let mounts = vec![MountEntry::new("/dev/sda1", "/"), MountEntry::new("/dev/sdb1", &data)];
        let policy = KubeletPolicy::from_parts(CONFIG, mounts, &link, &data.join("containerd")).unwrap();

        let eviction = policy.eviction().unwrap();
        assert_eq!(eviction.node_fs_device, "/dev/sdb1");
        assert!(!eviction.dedicated_image_fs);

        let pool_device = policy.mount_device(&data.join("pool")).unwrap();
        assert_eq!(pool_device, "/dev/sdb1");
        assert!((eviction.usable_fraction(&pool_device) - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_policy() {
        let policy = KubeletPolicy::load(&KubeletOptions::default()).unwrap();
        assert!(policy.eviction().is_none());
    }

    #[test]
    fn test_absent_config_has_no_policy() {
        let dir = tempfile::tempdir().unwrap();
        let opts = KubeletOptions {
            enabled: true,
            config_path: dir.path().join("config.yaml"),
            ..Default::default()
        };
        let policy = KubeletPolicy::load(&opts).unwrap();
        assert!(policy.eviction().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = KubeletPolicy::from_parts("evictionHard: [1, 2", mounts(), Path::new("/"), Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
    }
}
