//! # hostman Storage
//!
//! Local storage engine of the hostman node agent.
//!
//! Each hypervisor node owns a set of filesystem-backed storage pools. This
//! crate manages the disk images and copy-on-write snapshot chains inside
//! them:
//! - **Disk cache** - per-pool handles, re-probed on every lookup
//! - **Capacity** - free space reduced by kubelet hard-eviction floors
//! - **Migration** - destination-side rebuild of a disk and its snapshot chain
//! - **Export** - conversion and upload of a disk to the image registry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      StorageManager                             │
//! │  - Pool lookup by id, path or index                             │
//! │  - Accessibility checks and control-plane sync                  │
//! └─────────────────────────┬───────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      LocalStorage                               │
//! │  DiskCache · capacity · MigrationPreparer · ImageExporter       │
//! └───────┬──────────────┬──────────────┬──────────────┬────────────┘
//!         ▼              ▼              ▼              ▼
//!     ImageTool    RemoteFetcher    ComputeApi    ImageRegistry
//!    (qemu-img)       (HTTP)          (HTTP)         (HTTP)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hostman_storage::{MigrateRequest, MigrationDescriptor, PoolConfig, StorageManager};
//!
//! let manager = StorageManager::new("10.0.0.5", options, services);
//! let pool = manager.add_storage(PoolConfig::new("/data/pool0", 0)).await?;
//!
//! let mut desc = MigrationDescriptor {
//!     disk_id: "d1".into(),
//!     storage_id: "st-src".into(),
//!     snapshots: vec!["s1".into(), "s2".into()],
//!     template_id: Some("tmpl-a".into()),
//!     ..Default::default()
//! };
//! pool.destination_prepare_migrate(&req, &mut desc).await?;
//! ```

pub mod error;
pub mod types;
pub mod traits;
pub mod mock;
pub mod accessible;
pub mod cache;
pub mod capacity;
pub mod disk;
pub mod export;
pub mod image_cache;
pub mod kubelet;
pub mod local;
pub mod manager;
pub mod migrate;
pub mod qemu_img;
pub mod rebase;
pub mod snapshot;

pub use error::{Result, StorageError};
pub use traits::{ComputeApi, Disk, ImageCache, ImageRegistry, ImageTool, OsInspector, RemoteFetcher, ResourcePolicy};
pub use types::*;
pub use accessible::{check_accessible, ACCESSIBLE_TIMEOUT};
pub use cache::DiskCache;
pub use capacity::EvictionPolicy;
pub use disk::LocalDisk;
pub use export::ImageExporter;
pub use image_cache::LocalImageCache;
pub use kubelet::{KubeletOptions, KubeletPolicy, MountEntry};
pub use local::{LocalStorage, StorageServices, PROTOCOL_FUSE};
pub use manager::{PoolHealth, StorageManager};
pub use migrate::MigrationPreparer;
pub use qemu_img::QemuImg;
