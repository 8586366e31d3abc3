//! Storage backend abstraction.
//!
//! One [`Storage`] contract over three deployments: AWS S3, an S3-compatible
//! service (MinIO) and a local directory tree. The deployment is picked once in
//! [`connect`]; callers hold an `Arc<dyn Storage>` and never look at the kind
//! again.
//!
//! Keys are flat content hashes for samples, but artifact keys may be nested
//! (`<guid>/<file>`), so all variants accept `/`-separated keys. Keys must not be
//! empty, start with `/` or contain `..`.

pub mod local;
pub mod object;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

pub use local::LocalStorage;
pub use object::ObjectStorage;

/// Which storage deployment backs a [`Storage`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    Aws,
    Minio,
    Local,
}

impl fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentKind::Aws => "aws",
            DeploymentKind::Minio => "minio",
            DeploymentKind::Local => "local",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for DeploymentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(DeploymentKind::Aws),
            "minio" => Ok(DeploymentKind::Minio),
            "local" => Ok(DeploymentKind::Local),
            other => Err(Error::InvalidInput(format!(
                "unsupported deployment kind: {other:?} (expected aws, minio or local)"
            ))),
        }
    }
}

/// Credentials for exactly one deployment kind.
#[derive(Clone, PartialEq, Eq)]
pub enum Deployment {
    Aws {
        region: String,
        access_key: String,
        secret_key: String,
    },
    Minio {
        endpoint: String,
        region: String,
        access_key: String,
        secret_key: String,
    },
    Local {
        root_dir: PathBuf,
    },
}

impl Deployment {
    pub fn kind(&self) -> DeploymentKind {
        match self {
            Deployment::Aws { .. } => DeploymentKind::Aws,
            Deployment::Minio { .. } => DeploymentKind::Minio,
            Deployment::Local { .. } => DeploymentKind::Local,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deployment::Aws { region, .. } => {
                f.debug_struct("Aws").field("region", region).finish_non_exhaustive()
            }
            Deployment::Minio {
                endpoint, region, ..
            } => f
                .debug_struct("Minio")
                .field("endpoint", endpoint)
                .field("region", region)
                .finish_non_exhaustive(),
            Deployment::Local { root_dir } => {
                f.debug_struct("Local").field("root_dir", root_dir).finish()
            }
        }
    }
}

/// Everything needed to construct a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    /// Default bucket (container) used by commands that do not name one.
    pub bucket: String,
    pub deployment: Deployment,
}

impl StorageOptions {
    pub fn kind(&self) -> DeploymentKind {
        self.deployment.kind()
    }
}

/// Uniform contract over every storage deployment.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stream `reader` into `bucket/key`, replacing any existing object.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;

    /// Stream the object at `bucket/key` into `writer`.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    /// Remove `bucket/key`; a missing key is `NotFound` on every variant.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Keys in `bucket` starting with `prefix` (empty lists everything).
    ///
    /// The stream is lazy and finite; calling `list` again starts over.
    /// Placeholder entries are passed through, see [`is_placeholder`].
    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>>;

    fn kind(&self) -> DeploymentKind;
}

/// Build the backend selected by `options.deployment`.
pub async fn connect(options: StorageOptions) -> Result<Arc<dyn Storage>> {
    tracing::info!(
        kind = %options.kind(),
        bucket = %options.bucket,
        "Connecting storage backend"
    );
    let storage: Arc<dyn Storage> = match options.deployment {
        Deployment::Aws {
            region,
            access_key,
            secret_key,
        } => Arc::new(ObjectStorage::aws(region, access_key, secret_key)?),
        Deployment::Minio {
            endpoint,
            region,
            access_key,
            secret_key,
        } => Arc::new(ObjectStorage::minio(endpoint, region, access_key, secret_key)?),
        Deployment::Local { root_dir } => Arc::new(LocalStorage::new(root_dir).await?),
    };
    Ok(storage)
}

/// Directory-like entries some backends emit (`foo/`). Callers skip them.
pub fn is_placeholder(key: &str) -> bool {
    key.ends_with('/')
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(Error::InvalidKey(format!("{key:?}")));
    }
    Ok(())
}

pub(crate) fn validate_bucket(bucket: &str) -> Result<()> {
    if bucket.is_empty() || bucket.contains('/') || bucket == ".." || bucket == "." {
        return Err(Error::InvalidInput(format!("invalid bucket name: {bucket:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deployment_kinds_case_insensitively() {
        assert_eq!("AWS".parse::<DeploymentKind>().unwrap(), DeploymentKind::Aws);
        assert_eq!("minio".parse::<DeploymentKind>().unwrap(), DeploymentKind::Minio);
        assert_eq!(" local ".parse::<DeploymentKind>().unwrap(), DeploymentKind::Local);
        assert!("gcp".parse::<DeploymentKind>().is_err());
    }

    #[test]
    fn rejects_traversal_and_absolute_keys() {
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/../../b").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("guid/report.json").is_ok());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let deployment = Deployment::Minio {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            access_key: "AKIA-ACCESS".into(),
            secret_key: "very-secret".into(),
        };
        let rendered = format!("{deployment:?}");
        assert!(rendered.contains("localhost:9000"));
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("AKIA-ACCESS"));
    }

    #[test]
    fn placeholders_end_with_a_separator() {
        assert!(is_placeholder("guid/"));
        assert!(!is_placeholder("guid/file"));
    }
}
