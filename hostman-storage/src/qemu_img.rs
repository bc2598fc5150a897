//! qemu-img backed image tool.
//!
//! Creates, inspects, rebases and converts disk images by shelling out to
//! `qemu-img`.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::error::{Result, StorageError};
use crate::traits::ImageTool;
use crate::types::{CreateRawOptions, DiskFormat, DiskInfo};

/// Image tool driving the `qemu-img` binary.
#[derive(Debug, Clone)]
pub struct QemuImg {
    /// qemu-img binary path
    qemu_img_path: String,
}

impl QemuImg {
    /// Use `qemu-img` from `PATH`.
    pub fn new() -> Self {
        Self {
            qemu_img_path: "qemu-img".to_string(),
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            qemu_img_path: path.into(),
        }
    }

    async fn run(&self, args: Vec<OsString>) -> Result<Vec<u8>> {
        debug!(args = ?args, "Running qemu-img");

        let output = Command::new(&self.qemu_img_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| StorageError::Internal(format!("Failed to execute qemu-img: {}", e)))?;

        if !output.status.success() {
            return Err(StorageError::ToolFailed {
                tool: "qemu-img".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// Check if qemu-img is available.
    pub async fn version(&self) -> Result<String> {
        let stdout = self.run(vec!["--version".into()]).await?;
        let version = String::from_utf8_lossy(&stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a LUKS passphrase to an owner-only file for `secret,file=`.
fn secret_file(key: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::Builder::new()
        .prefix("qemu-img-secret")
        .tempfile()
        .map_err(|e| StorageError::Internal(format!("Failed to create secret file: {}", e)))?;
    let path = file.path().to_path_buf();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| StorageError::io(&path, e))?;
    file.write_all(key.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| StorageError::io(&path, e))?;
    Ok(file)
}

/// Build the `qemu-img create` argument list.
///
/// `secret` is the file holding the passphrase of an encrypted image.
fn create_args(
    path: &Path,
    opts: &CreateRawOptions,
    backing_format: Option<&str>,
    secret: Option<&Path>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["create".into(), "-f".into(), opts.format.as_str().into()];

    if let Some(backing) = &opts.backing_file {
        args.push("-b".into());
        args.push(backing.as_os_str().to_owned());
        args.push("-F".into());
        args.push(backing_format.unwrap_or(DiskFormat::Qcow2.as_str()).into());
    }

    if let (Some(encrypt), Some(secret)) = (&opts.encrypt, secret) {
        args.push("--object".into());
        args.push(format!("secret,id={},file={}", encrypt.key_id, secret.display()).into());
        args.push("-o".into());
        args.push(format!("encrypt.format=luks,encrypt.key-secret={}", encrypt.key_id).into());
    }

    args.push(path.as_os_str().to_owned());
    if opts.size_mb > 0 {
        args.push(format!("{}M", opts.size_mb).into());
    }
    args
}

/// Build the `qemu-img convert` argument list writing into `tmp`.
fn convert_args(path: &Path, tmp: &Path, format: DiskFormat, compress: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["convert".into(), "-O".into(), format.as_str().into()];
    match format {
        DiskFormat::Qcow2 if compress => args.push("-c".into()),
        DiskFormat::Vmdk => {
            args.push("-o".into());
            args.push("subformat=streamOptimized".into());
        }
        _ => {}
    }
    args.push(path.as_os_str().to_owned());
    args.push(tmp.as_os_str().to_owned());
    args
}

fn parse_info(path: &Path, stdout: &[u8]) -> Result<DiskInfo> {
    let info: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| StorageError::Internal(format!("Failed to parse qemu-img output: {}", e)))?;

    Ok(DiskInfo {
        path: path.to_path_buf(),
        format: info["format"].as_str().unwrap_or("unknown").to_string(),
        virtual_size: info["virtual-size"].as_u64().unwrap_or(0),
        actual_size: info["actual-size"].as_u64().unwrap_or(0),
        backing_file: info["backing-filename"].as_str().map(PathBuf::from),
    })
}

#[async_trait]
impl ImageTool for QemuImg {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn info(&self, path: &Path) -> Result<DiskInfo> {
        if !path.exists() {
            return Err(StorageError::NotFound(format!("disk image {}", path.display())));
        }

        let stdout = self
            .run(vec![
                "info".into(),
                "--output=json".into(),
                "-U".into(),
                path.as_os_str().to_owned(),
            ])
            .await?;
        parse_info(path, &stdout)
    }

    #[instrument(skip(self, opts), fields(path = %path.display(), size_mb = opts.size_mb))]
    async fn create(&self, path: &Path, opts: &CreateRawOptions) -> Result<()> {
        if path.exists() {
            return Err(StorageError::InvalidConfig(format!(
                "Disk image already exists: {}",
                path.display()
            )));
        }

        let backing_format = match &opts.backing_file {
            Some(backing) => Some(self.info(backing).await?.format),
            None => None,
        };

        let secret = opts.encrypt.as_ref().map(|e| secret_file(&e.key)).transpose()?;
        let secret_path = secret.as_ref().map(|f| f.path());
        self.run(create_args(path, opts, backing_format.as_deref(), secret_path)).await?;
        info!(format = %opts.format, backing = ?opts.backing_file, "Disk image created");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display(), backing = %backing.display()))]
    async fn rebase(&self, path: &Path, backing: &Path, safe: bool) -> Result<()> {
        let backing_format = self.info(backing).await?.format;

        let mut args: Vec<OsString> = vec!["rebase".into()];
        if !safe {
            args.push("-u".into());
        }
        args.push("-b".into());
        args.push(backing.as_os_str().to_owned());
        args.push("-F".into());
        args.push(backing_format.into());
        args.push(path.as_os_str().to_owned());

        self.run(args).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display(), format = %format))]
    async fn convert(&self, path: &Path, format: DiskFormat, compress: bool) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".convert");
        let tmp = PathBuf::from(tmp);

        if let Err(e) = self.run(convert_args(path, &tmp, format, compress)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        info!("Disk image converted");
        Ok(())
    }
}
