//! Configuration management for the node agent.

use anyhow::{Context, Result};
use hostman_storage::{DiskFormat, KubeletOptions, LocalStorageOptions, MediumType, PoolConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cli::Args;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostman/host.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host identity
    pub host: HostConfig,
    /// Local storage pools
    pub storage: StorageConfig,
    /// Kubelet eviction policy source
    pub kubelet: KubeletOptions,
    /// Control plane endpoints
    pub control_plane: ControlPlaneConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Defaults plus CLI arguments.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref zone) = args.zone {
            self.host.zone = zone.clone();
        }

        if let Some(ref master_ip) = args.master_ip {
            self.host.master_ip = master_ip.clone();
        }

        if !args.storage_paths.is_empty() {
            self.storage.local_paths = args.storage_paths.iter().map(PathBuf::from).collect();
            self.storage.names.clear();
        }

        self
    }

    /// One pool per configured path, indexed by position.
    pub fn pool_configs(&self) -> Vec<PoolConfig> {
        self.storage
            .local_paths
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let mut pool = PoolConfig::new(path, index)
                    .with_zone(&self.host.zone)
                    .with_medium_type(self.storage.medium_type);
                if let Some(name) = self.storage.names.get(index).filter(|n| !n.is_empty()) {
                    pool = pool.with_name(name);
                }
                pool
            })
            .collect()
    }

    pub fn local_storage_options(&self) -> LocalStorageOptions {
        LocalStorageOptions {
            recycle_diskfile: self.storage.recycle_diskfile,
            snapshot_dir_suffix: self.storage.snapshot_dir_suffix.clone(),
            default_image_save_format: self.storage.default_image_save_format,
            fetcherfs_path: self.storage.fetcherfs_path.clone(),
            fetcherfs_block_size_mb: self.storage.fetcherfs_block_size_mb,
        }
    }
}

/// Host identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Management IP, part of the composed pool names
    pub master_ip: String,
    pub zone: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            master_ip: "127.0.0.1".to_string(),
            zone: String::new(),
        }
    }
}

/// Local storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Pool roots in index order
    pub local_paths: Vec<PathBuf>,
    pub medium_type: MediumType,
    /// Display names by pool index
    pub names: Vec<String>,
    /// Move deleted disk files to the recycle area
    pub recycle_diskfile: bool,
    pub snapshot_dir_suffix: String,
    pub default_image_save_format: DiskFormat,
    /// Shared image cache directory
    pub image_cache_path: Option<PathBuf>,
    /// Control-plane id of the image cache
    pub image_cache_id: Option<String>,
    pub qemu_img_path: String,
    pub fetcherfs_path: String,
    pub fetcherfs_block_size_mb: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let options = LocalStorageOptions::default();
        Self {
            local_paths: vec![PathBuf::from("/opt/cloud/workspace/disks")],
            medium_type: MediumType::default(),
            names: Vec::new(),
            recycle_diskfile: options.recycle_diskfile,
            snapshot_dir_suffix: options.snapshot_dir_suffix,
            default_image_save_format: options.default_image_save_format,
            image_cache_path: Some(PathBuf::from("/opt/cloud/workspace/disks/image_cache")),
            image_cache_id: None,
            qemu_img_path: "qemu-img".to_string(),
            fetcherfs_path: options.fetcherfs_path,
            fetcherfs_block_size_mb: options.fetcherfs_block_size_mb,
        }
    }
}

/// Control plane endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Compute service base URL
    pub compute_url: String,
    /// Image registry base URL
    pub image_url: String,
    /// Deploy service base URL, used for guest OS inspection
    pub deploy_url: String,
    /// Pool info sync interval in seconds
    pub sync_interval_secs: u64,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            compute_url: "http://localhost:8888".to_string(),
            image_url: "http://localhost:9292".to_string(),
            deploy_url: "http://localhost:8889".to_string(),
            sync_interval_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const YAML: &str = r#"
host:
  master_ip: 10.0.0.5
  zone: zone-a
storage:
  local_paths:
    - /data/pool0
    - /data/pool1
  names: ["", "fast-pool"]
  medium_type: rotate
  recycle_diskfile: false
  snapshot_dir_suffix: _snap
  default_image_save_format: vmdk
  image_cache_path: /data/image_cache
kubelet:
  enabled: true
  config_path: /etc/kubernetes/kubelet.yaml
control_plane:
  compute_url: http://region:8888
  sync_interval_secs: 15
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.host.master_ip, "10.0.0.5");
        assert_eq!(config.storage.medium_type, MediumType::Rotate);
        assert_eq!(config.storage.default_image_save_format, DiskFormat::Vmdk);
        assert!(config.kubelet.enabled);
        assert_eq!(config.kubelet.root_dir, PathBuf::from("/var/lib/kubelet"));
        assert_eq!(config.control_plane.sync_interval_secs, 15);
        assert_eq!(config.control_plane.request_timeout_secs, 30);

        let pools = config.pool_configs();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name, None);
        assert_eq!(pools[1].name.as_deref(), Some("fast-pool"));
        assert_eq!(pools[1].index, 1);
        assert_eq!(pools[1].zone, "zone-a");

        let options = config.local_storage_options();
        assert!(!options.recycle_diskfile);
        assert_eq!(options.snapshot_dir_suffix, "_snap");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert!(config.storage.recycle_diskfile);
        assert_eq!(config.storage.snapshot_dir_suffix, "");
        assert!(!config.kubelet.enabled);
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "hostman-node",
            "--zone",
            "zone-b",
            "--master-ip",
            "192.168.1.10",
            "--storage-path",
            "/mnt/a",
            "--storage-path",
            "/mnt/b",
        ]);
        let config = Config::from_yaml(YAML).unwrap().with_cli_overrides(&args);
        assert_eq!(config.host.zone, "zone-b");
        assert_eq!(config.host.master_ip, "192.168.1.10");
        assert_eq!(
            config.storage.local_paths,
            vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")]
        );
        assert!(config.pool_configs().iter().all(|p| p.name.is_none()));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path().join("host.yaml")).is_err());

        let path = dir.path().join("host.yaml");
        std::fs::write(&path, YAML).unwrap();
        assert_eq!(Config::load(&path).unwrap().storage.local_paths.len(), 2);
    }
}
