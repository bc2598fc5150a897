//! HTTP remote file fetcher for peer disk and snapshot transfers.

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use hostman_storage::{RemoteFetcher, Result, StorageError};

/// Digest header sent by peers that checksum their transfers.
pub const SHA256_HEADER: &str = "X-Sha256";

/// Streams a remote file to `<dest>.tmp` and renames it into place once verified.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, url: &str, tmp: &Path) -> std::result::Result<u64, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("peer answered {}", status));
        }

        let expected_len = resp.content_length();
        let expected_digest = resp
            .headers()
            .get(SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| format!("create {}: {}", tmp.display(), e))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| format!("transfer interrupted: {}", e))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("write {}: {}", tmp.display(), e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| format!("flush {}: {}", tmp.display(), e))?;
        file.sync_all()
            .await
            .map_err(|e| format!("sync {}: {}", tmp.display(), e))?;

        verify(expected_len, expected_digest.as_deref(), written, &hex::encode(hasher.finalize()))?;
        Ok(written)
    }
}

fn verify(expected_len: Option<u64>, expected_digest: Option<&str>, written: u64, digest: &str) -> std::result::Result<(), String> {
    if let Some(len) = expected_len {
        if len != written {
            return Err(format!("short transfer: got {} of {} bytes", written, len));
        }
    }
    if let Some(expected) = expected_digest {
        if expected != digest {
            return Err(format!("checksum mismatch: expected {}, got {}", expected, digest));
        }
    }
    Ok(())
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let tmp = tmp_path(dest);
        debug!(url = %url, tmp = %tmp.display(), "Fetching remote file");

        match self.download(url, &tmp).await {
            Ok(bytes) => {
                tokio::fs::rename(&tmp, dest)
                    .await
                    .map_err(|e| StorageError::io(dest, e))?;
                info!(url = %url, dest = %dest.display(), bytes, "Remote file fetched");
                Ok(())
            }
            Err(reason) => {
                if let Err(e) = tokio::fs::remove_file(&tmp).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(tmp = %tmp.display(), error = %e, "Failed to remove partial download");
                    }
                }
                Err(StorageError::FetchFailed {
                    url: url.to_string(),
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify() {
        let digest = hex::encode(Sha256::digest(b"snapshot"));
        assert!(verify(Some(8), Some(&digest), 8, &digest).is_ok());
        assert!(verify(None, None, 8, &digest).is_ok());
        assert!(verify(Some(16), None, 8, &digest).unwrap_err().contains("short transfer"));
        assert!(verify(None, Some("deadbeef"), 8, &digest).unwrap_err().contains("checksum"));
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path(Path::new("/data/pool0/snapshots/d1/s1")),
            PathBuf::from("/data/pool0/snapshots/d1/s1.tmp")
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("s1");
        let fetcher = HttpFetcher::new(reqwest::Client::new());

        let err = fetcher.fetch("http://127.0.0.1:1/s1", &dest).await.unwrap_err();
        assert!(matches!(err, StorageError::FetchFailed { ref url, .. } if url == "http://127.0.0.1:1/s1"));
        assert!(!dest.exists());
        assert!(!tmp_path(&dest).exists());
    }
}
