use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{validate_bucket, validate_key, DeploymentKind, Storage};
use crate::error::{Error, Result};

type StoreResolver = Arc<dyn Fn(&str) -> Result<Arc<dyn ObjectStore>> + Send + Sync>;

/// S3 and S3-compatible storage on top of `object_store`.
///
/// `object_store` binds a client to one bucket, so the bucket named in each
/// call is resolved to a store through `resolve`.
#[derive(Clone)]
pub struct ObjectStorage {
    kind: DeploymentKind,
    resolve: StoreResolver,
}

impl ObjectStorage {
    /// AWS S3 in `region` with static credentials.
    pub fn aws(region: String, access_key: String, secret_key: String) -> Result<Self> {
        let template = AmazonS3Builder::new()
            .with_region(region)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
        Self::from_builder(DeploymentKind::Aws, template)
    }

    /// S3-compatible service (e.g. MinIO) at `endpoint`, path-style addressing.
    /// Plain HTTP is allowed only when the endpoint asks for it.
    pub fn minio(
        endpoint: String,
        region: String,
        access_key: String,
        secret_key: String,
    ) -> Result<Self> {
        let allow_http = endpoint.starts_with("http://");
        let template = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_allow_http(allow_http)
            .with_virtual_hosted_style_request(false)
            .with_region(region)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
        Self::from_builder(DeploymentKind::Minio, template)
    }

    /// Serve each bucket from a caller-provided store, e.g.
    /// `object_store::memory::InMemory`.
    pub fn with_stores(kind: DeploymentKind, stores: HashMap<String, Arc<dyn ObjectStore>>) -> Self {
        let resolve = move |bucket: &str| -> Result<Arc<dyn ObjectStore>> {
            stores
                .get(bucket)
                .cloned()
                .ok_or_else(|| Error::InvalidInput(format!("no store configured for bucket {bucket:?}")))
        };
        ObjectStorage {
            kind,
            resolve: Arc::new(resolve),
        }
    }

    fn from_builder(kind: DeploymentKind, template: AmazonS3Builder) -> Result<Self> {
        // Surface malformed endpoints and credentials now rather than on first use.
        template
            .clone()
            .with_bucket_name("config-check")
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, %kind, "Invalid object storage configuration");
                Error::InvalidInput(e.to_string())
            })?;

        let resolve = move |bucket: &str| -> Result<Arc<dyn ObjectStore>> {
            let store = template
                .clone()
                .with_bucket_name(bucket)
                .build()
                .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
            Ok(Arc::new(store))
        };
        Ok(ObjectStorage {
            kind,
            resolve: Arc::new(resolve),
        })
    }

    fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        validate_bucket(bucket)?;
        (self.resolve)(bucket)
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        validate_key(key)?;
        let store = self.store_for(bucket)?;
        let start = std::time::Instant::now();

        let mut writer = BufWriter::new(store, Path::from(key));
        let copied = match tokio::io::copy(reader, &mut writer).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, bucket, key, "Object upload failed while streaming");
                return Err(Error::BackendUnavailable(e.to_string()));
            }
        };
        writer.shutdown().await.map_err(|e| {
            tracing::error!(error = %e, bucket, key, "Object upload failed to complete");
            Error::BackendUnavailable(e.to_string())
        })?;

        tracing::info!(
            kind = %self.kind,
            bucket,
            key,
            size_bytes = copied,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Object upload successful"
        );
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        validate_key(key)?;
        let store = self.store_for(bucket)?;
        let start = std::time::Instant::now();

        let result = store.get(&Path::from(key)).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => Error::NotFound(format!("{bucket}/{key}")),
            other => {
                tracing::error!(error = %other, bucket, key, "Object download failed");
                Error::BackendUnavailable(other.to_string())
            }
        })?;

        let mut chunks = result.into_stream();
        let mut size: u64 = 0;
        while let Some(chunk) = chunks.try_next().await? {
            size += chunk.len() as u64;
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;

        tracing::info!(
            kind = %self.kind,
            bucket,
            key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Object download successful"
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        validate_key(key)?;
        let store = self.store_for(bucket)?;
        let location = Path::from(key);

        // S3 acknowledges deletes of missing keys; check first so every
        // variant reports NotFound the same way.
        match store.head(&location).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {
                tracing::warn!(bucket, key, "Delete of missing object");
                return Err(Error::NotFound(format!("{bucket}/{key}")));
            }
            Err(e) => return Err(e.into()),
        }

        store.delete(&location).await.map_err(|e| {
            tracing::error!(error = %e, bucket, key, "Object delete failed");
            Error::from(e)
        })?;
        tracing::info!(kind = %self.kind, bucket, key, "Object delete successful");
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>> {
        let store = match self.store_for(bucket) {
            Ok(store) => store,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        // object_store lists by path segments, so list the enclosing
        // directory and apply the string prefix here.
        let prefix = prefix.to_string();
        let parent = prefix
            .rsplit_once('/')
            .map(|(dir, _)| Path::from(dir))
            .filter(|dir| !dir.as_ref().is_empty());

        store
            .list(parent.as_ref())
            .map_err(Error::from)
            .map_ok(|meta| meta.location.to_string())
            .try_filter(move |key| futures::future::ready(key.starts_with(&prefix)))
            .boxed()
    }

    fn kind(&self) -> DeploymentKind {
        self.kind
    }
}
