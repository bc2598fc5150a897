//! Storage type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage type reported to the control plane for local pools.
pub const STORAGE_LOCAL: &str = "local";

/// Disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
        }
    }

    /// Parse a qemu-img format name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qcow2" => Some(DiskFormat::Qcow2),
            "raw" => Some(DiskFormat::Raw),
            "vmdk" => Some(DiskFormat::Vmdk),
            _ => None,
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical medium backing a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumType {
    #[default]
    Ssd,
    Rotate,
}

impl MediumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediumType::Ssd => "ssd",
            MediumType::Rotate => "rotate",
        }
    }
}

/// Host-wide options shared by all local pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageOptions {
    /// Move deleted disk files into the recycle area instead of removing them
    pub recycle_diskfile: bool,
    /// Appended to the disk id to name its snapshot directory
    pub snapshot_dir_suffix: String,
    /// Format used by image export when the request names none
    pub default_image_save_format: DiskFormat,
    /// FUSE helper used to expose remote images as local files
    pub fetcherfs_path: String,
    /// Block size handed to the FUSE helper
    pub fetcherfs_block_size_mb: u32,
}

impl Default for LocalStorageOptions {
    fn default() -> Self {
        Self {
            recycle_diskfile: true,
            snapshot_dir_suffix: String::new(),
            default_image_save_format: DiskFormat::Qcow2,
            fetcherfs_path: "/usr/bin/fetcherfs".to_string(),
            fetcherfs_block_size_mb: 16,
        }
    }
}

/// Static configuration of one local pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Filesystem root of the pool
    pub path: PathBuf,
    /// Ordinal among the local pools of this host
    pub index: usize,
    /// Display name; the composed name is used when absent
    pub name: Option<String>,
    /// Medium type
    pub medium_type: MediumType,
    /// Zone the host belongs to
    pub zone: String,
}

impl PoolConfig {
    /// Create a config for a local pool at `path`.
    pub fn new(path: impl Into<PathBuf>, index: usize) -> Self {
        Self {
            path: path.into(),
            index,
            name: None,
            medium_type: MediumType::default(),
            zone: String::new(),
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_medium_type(mut self, medium_type: MediumType) -> Self {
        self.medium_type = medium_type;
        self
    }
}

/// Pool info pushed to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSyncInfo {
    pub name: String,
    /// Available capacity in MiB
    pub capacity: u64,
    /// Used capacity in MiB
    pub actual_capacity_used: u64,
    pub storage_type: String,
    pub medium_type: String,
    pub zone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storagecache_id: Option<String>,
}

/// Filesystem statistics of a pool root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl FsStats {
    pub fn total_mb(&self) -> u64 {
        self.total_bytes / 1024 / 1024
    }

    pub fn used_mb(&self) -> u64 {
        self.used_bytes / 1024 / 1024
    }

    pub fn available_mb(&self) -> u64 {
        self.available_bytes / 1024 / 1024
    }
}

/// Information about a disk image.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskInfo {
    /// Path to the disk image
    pub path: PathBuf,
    /// Disk format (qcow2, raw, etc.)
    pub format: String,
    /// Virtual size in bytes
    pub virtual_size: u64,
    /// Actual size on disk in bytes
    pub actual_size: u64,
    /// Backing file (for copy-on-write images)
    pub backing_file: Option<PathBuf>,
}

impl DiskInfo {
    /// Get the virtual size in MiB.
    pub fn virtual_size_mb(&self) -> u64 {
        self.virtual_size / 1024 / 1024
    }
}

/// Disk encryption parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptInfo {
    /// Key identifier, used as the qemu secret object id
    pub key_id: String,
    /// Passphrase protecting the LUKS header
    pub key: String,
}

/// Parameters of a raw disk creation.
#[derive(Debug, Clone)]
pub struct CreateRawOptions {
    pub size_mb: u64,
    pub format: DiskFormat,
    /// Filesystem to format the new image with (raw images only)
    pub fs_format: Option<String>,
    pub encrypt: Option<EncryptInfo>,
    pub backing_file: Option<PathBuf>,
}

impl CreateRawOptions {
    pub fn new(size_mb: u64, format: DiskFormat) -> Self {
        Self {
            size_mb,
            format,
            fs_format: None,
            encrypt: None,
            backing_file: None,
        }
    }

    pub fn with_backing_file(mut self, backing: impl Into<PathBuf>) -> Self {
        self.backing_file = Some(backing.into());
        self
    }
}

/// A disk to reconstruct on this host during migration.
///
/// Lives for one prepare-migrate call; `path` is filled in on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    pub disk_id: String,
    /// Pool the disk lives in on the source host
    pub storage_id: String,
    /// Size in MiB, used for live migration overlays
    pub size_mb: u64,
    pub template_id: Option<String>,
    /// Backing file of the live migration overlay
    pub backing_file: Option<String>,
    /// Snapshot ids in chain order, oldest first
    pub snapshots: Vec<String>,
    /// Local disk path, published on success
    pub path: Option<PathBuf>,
}

/// Transfer parameters of a destination-side migration.
#[derive(Debug, Clone)]
pub struct MigrateRequest {
    pub live_migrate: bool,
    /// Base URL of the source disk transfer endpoint
    pub disks_uri: String,
    /// Base URL of the source snapshot transfer endpoint
    pub snapshots_uri: String,
    /// Rebase fetched layers onto their predecessors
    pub rebase_disks: bool,
}

/// Parameters of a disk export to the image registry.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub image_id: String,
    pub image_path: PathBuf,
    pub compress: bool,
    /// Target format; the host default is used when absent
    pub format: Option<DiskFormat>,
}

/// Parameters of a disk created from a remote snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSource {
    pub snapshot_url: String,
    pub protocol: String,
    pub size_mb: u64,
}

/// Release information found inside a guest image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub distro: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub language: String,
}

/// OS identification of a guest image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    #[serde(default)]
    pub os_type: String,
    pub release: Option<ReleaseInfo>,
}

/// Metadata sent along with an uploaded image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageUploadParams {
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_distribution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_language: Option<String>,
}

impl ImageUploadParams {
    /// Build upload metadata from the OS identification of the image.
    pub fn from_os_info(image_id: &str, info: &OsInfo) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let mut params = Self {
            image_id: image_id.to_string(),
            os_type: non_empty(&info.os_type),
            ..Default::default()
        };
        if let Some(rel) = &info.release {
            params.os_distribution = Some(rel.distro.clone());
            params.os_version = non_empty(&rel.version);
            params.os_arch = non_empty(&rel.arch);
            params.os_language = non_empty(&rel.language);
        }
        params
    }
}
