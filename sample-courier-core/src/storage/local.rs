use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use walkdir::WalkDir;

use super::{validate_bucket, validate_key, DeploymentKind, Storage};
use crate::error::{Error, Result};

const STAGING_DIR: &str = ".staging";
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local directory tree: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Creates `root` if it does not exist yet.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            tracing::error!(error = ?e, root = %root.display(), "Failed to create local storage root");
            Error::BackendUnavailable(format!(
                "failed to create storage directory {}: {e}",
                root.display()
            ))
        })?;
        tracing::debug!(root = %root.display(), "Local storage ready");
        Ok(LocalStorage { root })
    }

    /// Fresh scratch file under `<root>/.staging`, which no bucket name can
    /// collide with.
    fn staging_path(&self) -> PathBuf {
        let n = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(STAGING_DIR)
            .join(format!("upload-{}-{n}", std::process::id()))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let mut path = self.root.join(bucket);
        for part in key.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        Ok(path)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Objects only appear under their key once fully written.
        let staging = self.staging_path();
        let written = match write_staged(&staging, &path, reader).await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "Local storage upload failed");
                if let Err(cleanup) = fs::remove_file(&staging).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(error = %cleanup, staging = %staging.display(), "Failed to remove staged upload");
                    }
                }
                return Err(e);
            }
        };

        tracing::info!(
            bucket,
            key,
            path = %path.display(),
            size_bytes = written,
            "Local storage upload successful"
        );
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{bucket}/{key}")));
            }
            Err(e) => return Err(e.into()),
        };
        let read = tokio::io::copy(&mut file, writer).await?;
        writer.flush().await?;

        tracing::info!(bucket, key, size_bytes = read, "Local storage download successful");
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(bucket, key, "Local storage delete successful");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(bucket, key, "Delete of missing local object");
                Err(Error::NotFound(format!("{bucket}/{key}")))
            }
            Err(e) => {
                tracing::error!(error = ?e, path = %path.display(), "Local storage delete failed");
                Err(e.into())
            }
        }
    }

    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>> {
        if let Err(e) = validate_bucket(bucket) {
            return stream::once(async move { Err(e) }).boxed();
        }
        let dir = self.root.join(bucket);
        let prefix = prefix.to_string();

        stream::once(async move {
            match tokio::task::spawn_blocking(move || scan_bucket(&dir, &prefix)).await {
                Ok(keys) => keys,
                Err(e) => Err(Error::BackendUnavailable(format!("listing task failed: {e}"))),
            }
        })
        .map_ok(|keys| stream::iter(keys.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Local
    }
}

async fn write_staged(
    staging: &Path,
    path: &Path,
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<u64> {
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(staging).await?;
    let written = tokio::io::copy(reader, &mut file).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(staging, path).await?;
    Ok(written)
}

/// Regular files under `dir` as `/`-joined relative keys, sorted.
/// A bucket directory that was never written to lists as empty.
fn scan_bucket(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut keys = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.starts_with(prefix) {
            keys.push(key);
        }
    }
    Ok(keys)
}
