//! Local image cache pool.
//!
//! Base and template images shared by the pools of this host, stored flat as
//! `<cache>/<image_id>`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::traits::{ImageCache, ImageTool};
use crate::types::DiskInfo;

/// Image cache rooted at a local directory.
pub struct LocalImageCache {
    id: RwLock<String>,
    path: PathBuf,
    tool: Arc<dyn ImageTool>,
    images: Mutex<HashMap<String, DiskInfo>>,
}

impl LocalImageCache {
    pub fn new(path: impl Into<PathBuf>, tool: Arc<dyn ImageTool>) -> Self {
        Self {
            id: RwLock::new(String::new()),
            path: path.into(),
            tool,
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Adopt the identifier assigned by the control plane.
    pub fn set_id(&self, id: &str) {
        match self.id.write() {
            Ok(mut slot) => *slot = id.to_string(),
            Err(_) => warn!(id = %id, "Image cache id lock poisoned"),
        }
    }

    /// Whether `image_id` was loaded into the cache.
    pub fn is_cached(&self, image_id: &str) -> bool {
        self.images
            .lock()
            .map(|images| images.contains_key(image_id))
            .unwrap_or(false)
    }

    /// Info of a loaded image.
    pub fn cached_info(&self, image_id: &str) -> Option<DiskInfo> {
        self.images.lock().ok()?.get(image_id).cloned()
    }

    /// Path of a template image inside the cache.
    pub fn template_path(&self, template_id: &str) -> PathBuf {
        template_path_in(&self.path, template_id)
    }
}

/// `<cache>/<template_id>`, or the id itself when it is already absolute.
pub(crate) fn template_path_in(cache: &Path, template_id: &str) -> PathBuf {
    let id = Path::new(template_id);
    if id.is_absolute() {
        id.to_path_buf()
    } else {
        cache.join(id)
    }
}

#[async_trait]
impl ImageCache for LocalImageCache {
    fn id(&self) -> String {
        self.id.read().map(|id| id.clone()).unwrap_or_default()
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn load_image_cache(&self, image_id: &str) -> Result<()> {
        let image_path = self.path.join(image_id);
        let info = self
            .tool
            .info(&image_path)
            .await
            .map_err(|e| StorageError::NotFound(format!("cached image {}: {}", image_id, e)))?;

        info!(
            image_id = %image_id,
            path = %image_path.display(),
            format = %info.format,
            "Image loaded into cache"
        );
        self.images
            .lock()
            .map_err(|_| StorageError::Internal("Lock poisoned".to_string()))?
            .insert(image_id.to_string(), info);
        Ok(())
    }
}
