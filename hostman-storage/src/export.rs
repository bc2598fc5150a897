//! Disk export to the image registry.

use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::traits::{ComputeApi, ImageCache, ImageRegistry, ImageTool, OsInspector};
use crate::types::{DiskFormat, ExportRequest, ImageUploadParams};

pub const STATUS_KILLED: &str = "killed";
pub const STATUS_READY: &str = "ready";

/// Exports a disk image and publishes it into the local image cache.
pub struct ImageExporter<'a> {
    tool: &'a dyn ImageTool,
    inspector: &'a dyn OsInspector,
    registry: &'a dyn ImageRegistry,
    compute: &'a dyn ComputeApi,
    image_cache: Option<&'a dyn ImageCache>,
    default_format: DiskFormat,
}

impl<'a> ImageExporter<'a> {
    pub fn new(
        tool: &'a dyn ImageTool,
        inspector: &'a dyn OsInspector,
        registry: &'a dyn ImageRegistry,
        compute: &'a dyn ComputeApi,
    ) -> Self {
        Self {
            tool,
            inspector,
            registry,
            compute,
            image_cache: None,
            default_format: DiskFormat::Qcow2,
        }
    }

    pub fn with_image_cache(mut self, cache: Option<&'a dyn ImageCache>) -> Self {
        self.image_cache = cache;
        self
    }

    /// Format used when the request names none.
    pub fn with_default_format(mut self, format: DiskFormat) -> Self {
        self.default_format = format;
        self
    }

    /// Upload `req.image_path` as image `req.image_id`.
    ///
    /// A failed export marks the image killed in the registry and returns the
    /// failure. A successful one hands the file over to the image cache, or
    /// removes it when the host has none.
    #[instrument(skip(self, req), fields(image_id = %req.image_id, path = %req.image_path.display()))]
    pub async fn export(&self, req: &ExportRequest) -> Result<()> {
        if let Err(e) = self.upload(req).await {
            error!(error = %e, "Save to image registry failed");
            self.report_killed(&req.image_id, &e.to_string()).await;
            return Err(e);
        }

        info!("Image uploaded to registry");
        self.publish(req).await;
        Ok(())
    }

    async fn upload(&self, req: &ExportRequest) -> Result<()> {
        let os_info = self.inspector.inspect(&req.image_path, req.compress).await?;

        if req.compress {
            let format = req.format.unwrap_or(self.default_format);
            if format == DiskFormat::Raw {
                return Err(StorageError::ConversionFailed(
                    "raw is not a compressed export format".to_string(),
                ));
            }
            self.tool
                .convert(&req.image_path, format, true)
                .await
                .map_err(|e| StorageError::ConversionFailed(format!("to {}: {}", format, e)))?;
        }

        let file = tokio::fs::File::open(&req.image_path)
            .await
            .map_err(|e| StorageError::io(&req.image_path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StorageError::io(&req.image_path, e))?
            .len();

        let params = ImageUploadParams::from_os_info(&req.image_id, &os_info);
        self.registry.upload(&params, file, size).await.map_err(|e| match e {
            StorageError::UploadFailed(_) => e,
            other => StorageError::UploadFailed(other.to_string()),
        })
    }

    async fn report_killed(&self, image_id: &str, reason: &str) {
        if let Err(e) = self.registry.update_status(image_id, STATUS_KILLED, reason).await {
            error!(image_id = %image_id, error = %e, "Failed to mark image killed");
        }
    }

    async fn publish(&self, req: &ExportRequest) {
        let Some(cache) = self.image_cache else {
            if let Err(e) = remove_if_exists(&req.image_path).await {
                warn!(error = %e, "Failed to remove exported image");
            }
            return;
        };

        let dest = cache.path().join(&req.image_id);
        if let Err(e) = move_file(&req.image_path, &dest).await {
            error!(dest = %dest.display(), error = %e, "Failed to move saved image to cache");
            return;
        }
        if let Err(e) = cache.load_image_cache(&req.image_id).await {
            error!(error = %e, "Failed to load saved image into cache");
            return;
        }
        if let Err(e) = self
            .compute
            .cache_image(&cache.id(), &req.image_id, STATUS_READY, &dest)
            .await
        {
            error!(error = %e, "Failed to announce cached image");
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StorageError::io(path, e)),
        _ => Ok(()),
    }
}

/// Rename `src` to `dest`, copying when they sit on different filesystems.
pub(crate) async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }

    let tmp = PathBuf::from(format!("{}.part", dest.display()));
    tokio::fs::copy(src, &tmp)
        .await
        .map_err(|e| StorageError::io(src, e))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| StorageError::io(dest, e))?;
    tokio::fs::remove_file(src)
        .await
        .map_err(|e| StorageError::io(src, e))
}
