//! Deploy service client used to identify the guest OS of an exported disk.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::debug;

use hostman_storage::{OsInfo, OsInspector, ReleaseInfo, Result, StorageError};

pub struct DeployClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
struct InspectResponse {
    #[serde(default)]
    os_info: String,
    release_info: Option<ReleaseInfo>,
}

impl From<InspectResponse> for OsInfo {
    fn from(resp: InspectResponse) -> Self {
        OsInfo {
            os_type: resp.os_info,
            release: resp.release_info,
        }
    }
}

impl DeployClient {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl OsInspector for DeployClient {
    async fn inspect(&self, disk_path: &Path, compress: bool) -> Result<OsInfo> {
        let url = format!("{}/disks/save-prepare", self.base_url);
        debug!(url = %url, disk = %disk_path.display(), "Inspecting guest OS");

        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "disk_path": disk_path.display().to_string(),
                "compress": compress,
            }))
            .send()
            .await
            .map_err(|e| StorageError::ControlPlane(format!("Deploy service unreachable: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::ControlPlane(format!(
                "Deploy service failed: {} - {}",
                status, body
            )));
        }

        let info: InspectResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::ControlPlane(format!("Invalid deploy response: {}", e)))?;
        Ok(info.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_response() {
        let body = r#"{"os_info": "Linux", "release_info": {"distro": "CentOS", "version": "7.9", "arch": "x86_64"}}"#;
        let info: OsInfo = serde_json::from_str::<InspectResponse>(body).unwrap().into();
        assert_eq!(info.os_type, "Linux");
        let release = info.release.unwrap();
        assert_eq!(release.distro, "CentOS");
        assert_eq!(release.language, "");

        let info: OsInfo = serde_json::from_str::<InspectResponse>("{}").unwrap().into();
        assert_eq!(info, OsInfo::default());
    }
}
