//! HTTP clients for the compute service and the image registry.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use hostman_storage::{ComputeApi, ImageRegistry, ImageUploadParams, Result, StorageError, StorageSyncInfo};

/// Build a client for short control-plane calls.
pub fn api_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()?)
}

/// Build a client for bulk transfers, bounded only while connecting.
pub fn transfer_client(connect_timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().connect_timeout(connect_timeout).build()?)
}

/// Turn a non-success response into an error carrying its body.
async fn check(resp: reqwest::Response, map: fn(String) -> StorageError) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(map(format!("{} - {}", status, body)))
}

fn transport(e: reqwest::Error) -> StorageError {
    StorageError::ControlPlane(format!("Connection failed: {}", e))
}

/// Compute service client.
pub struct HttpComputeApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpComputeApi {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn storage_url(&self, storage_id: &str) -> String {
        format!("{}/storages/{}", self.base_url, storage_id)
    }

    async fn put_storage(&self, storage_id: &str, body: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .put(self.storage_url(storage_id))
            .json(&json!({ "storage": body }))
            .send()
            .await
            .map_err(transport)?;
        check(resp, StorageError::ControlPlane).await?;
        Ok(())
    }
}

fn storage_id_from(body: &serde_json::Value) -> Option<String> {
    body.get("storage")
        .unwrap_or(body)
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[async_trait]
impl ComputeApi for HttpComputeApi {
    async fn create_storage(&self, info: &StorageSyncInfo) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/storages", self.base_url))
            .json(&json!({ "storage": info }))
            .send()
            .await
            .map_err(transport)?;
        let body: serde_json::Value = check(resp, StorageError::ControlPlane)
            .await?
            .json()
            .await
            .map_err(transport)?;

        let id = storage_id_from(&body)
            .ok_or_else(|| StorageError::ControlPlane(format!("Create storage response missing id: {}", body)))?;
        info!(storage_id = %id, name = %info.name, "Storage created on control plane");
        Ok(id)
    }

    async fn update_storage(&self, storage_id: &str, info: &StorageSyncInfo) -> Result<()> {
        let body = serde_json::to_value(info).map_err(|e| StorageError::Internal(e.to_string()))?;
        self.put_storage(storage_id, body).await
    }

    async fn update_storage_used(&self, storage_id: &str, used_mb: u64) -> Result<()> {
        self.put_storage(storage_id, json!({ "actual_capacity_used": used_mb }))
            .await
    }

    async fn cache_image(
        &self,
        storagecache_id: &str,
        image_id: &str,
        status: &str,
        path: &Path,
    ) -> Result<()> {
        let url = format!("{}/storagecaches/{}/cache-image", self.base_url, storagecache_id);
        let resp = self
            .client
            .post(url)
            .json(&json!({
                "storagecache": {
                    "image_id": image_id,
                    "status": status,
                    "path": path.display().to_string(),
                }
            }))
            .send()
            .await
            .map_err(transport)?;
        check(resp, StorageError::ControlPlane).await?;
        Ok(())
    }
}

/// Image registry client.
pub struct HttpImageRegistry {
    base_url: String,
    api: reqwest::Client,
    transfer: reqwest::Client,
}

impl HttpImageRegistry {
    pub fn new(base_url: &str, api: reqwest::Client, transfer: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api,
            transfer,
        }
    }
}

/// `x-image-meta-*` headers describing an upload.
fn upload_headers(params: &ImageUploadParams, size: u64) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));

    let properties = [
        ("os_type", &params.os_type),
        ("os_distribution", &params.os_distribution),
        ("os_version", &params.os_version),
        ("os_arch", &params.os_arch),
        ("os_language", &params.os_language),
    ];
    for (key, value) in properties {
        let Some(value) = value else { continue };
        let name = HeaderName::try_from(format!("x-image-meta-property-{}", key))
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| StorageError::UploadFailed(format!("invalid {} value: {}", key, e)))?;
        headers.insert(name, value);
    }
    headers.insert("x-image-meta-size", HeaderValue::from(size));
    Ok(headers)
}

#[async_trait]
impl ImageRegistry for HttpImageRegistry {
    async fn upload(&self, params: &ImageUploadParams, file: tokio::fs::File, size: u64) -> Result<()> {
        let url = format!("{}/images/{}", self.base_url, params.image_id);
        debug!(url = %url, size, "Uploading image");

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let resp = self
            .transfer
            .put(url)
            .headers(upload_headers(params, size)?)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        check(resp, StorageError::UploadFailed).await?;

        info!(image_id = %params.image_id, size, "Image uploaded");
        Ok(())
    }

    async fn update_status(&self, image_id: &str, status: &str, reason: &str) -> Result<()> {
        let url = format!("{}/images/{}/update-status", self.base_url, image_id);
        let resp = self
            .api
            .post(url)
            .json(&json!({ "image": { "status": status, "reason": reason } }))
            .send()
            .await
            .map_err(transport)?;
        check(resp, StorageError::ControlPlane).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_id_from_response() {
        assert_eq!(
            storage_id_from(&json!({"storage": {"id": "st-1", "name": "x"}})).as_deref(),
            Some("st-1")
        );
        assert_eq!(storage_id_from(&json!({"id": "st-2"})).as_deref(), Some("st-2"));
        assert_eq!(storage_id_from(&json!({"storage": {}})), None);
    }

    #[test]
    fn test_upload_headers() {
        let params = ImageUploadParams {
            image_id: "img-1".to_string(),
            os_type: Some("Linux".to_string()),
            os_distribution: Some("Debian".to_string()),
            ..Default::default()
        };
        let headers = upload_headers(&params, 1024).unwrap();
        assert_eq!(headers["x-image-meta-property-os_type"], "Linux");
        assert_eq!(headers["x-image-meta-property-os_distribution"], "Debian");
        assert!(headers.get("x-image-meta-property-os_arch").is_none());
        assert_eq!(headers[CONTENT_LENGTH], "1024");
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = reqwest::Client::new();
        let api = HttpComputeApi::new("http://region:8888/", client);
        assert_eq!(api.storage_url("st-1"), "http://region:8888/storages/st-1");
    }
}
