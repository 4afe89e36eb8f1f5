//! Upload stage and blob store abstraction.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::errors::{ConfigError, UploadError};

const READ_CHUNK: usize = 64 * 1024;

/// Where an object lives: a bucket and a key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadTarget {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl UploadTarget {
    /// Creates a target.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses `scheme://bucket/key...`.
    ///
    /// The bucket is the first segment after the scheme and the key is the
    /// rest. Both must be non-empty.
    pub fn parse_url(url: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ConfigError::new(format!("output '{url}' is not a URL (expected s3://bucket/key)")))?;
        if scheme.is_empty() {
            return Err(ConfigError::new(format!("output '{url}' has no scheme")));
        }

        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConfigError::new(format!("output '{url}' has no bucket")));
        }
        if key.is_empty() {
            return Err(ConfigError::new(format!("output '{url}' has no object key")));
        }
        Ok(Self::new(bucket, key))
    }
}

impl FromStr for UploadTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_url(s)
    }
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Object storage used for artifacts and remote inputs.
///
/// One instance is shared by every run in the process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Streams the file at `local` to `target`, returning the bytes written.
    async fn put_object(&self, local: &Path, target: &UploadTarget) -> Result<u64, UploadError>;

    /// Downloads `source` into the file at `local`, returning the bytes read.
    async fn get_object(&self, source: &UploadTarget, local: &Path) -> Result<u64, UploadError>;
}

enum Backend {
    S3 {
        storage: StorageConfig,
        clients: DashMap<String, Arc<dyn ObjectStore>>,
    },
    Fixed(Arc<dyn ObjectStore>),
}

/// [`BlobStore`] on top of the `object_store` crate.
pub struct ObjectStoreBlobStore {
    backend: Backend,
}

impl ObjectStoreBlobStore {
    /// S3 (or an S3-compatible service). Credentials come from the
    /// environment; one client is built per bucket and reused.
    #[must_use]
    pub fn s3(storage: StorageConfig) -> Self {
        Self {
            backend: Backend::S3 {
                storage,
                clients: DashMap::new(),
            },
        }
    }

    /// A single store for every bucket; keys become `<bucket>/<key>`.
    #[must_use]
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend: Backend::Fixed(store),
        }
    }

    /// An in-memory store, for tests and dry runs.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(object_store::memory::InMemory::new()))
    }

    fn resolve(&self, target: &UploadTarget) -> Result<(Arc<dyn ObjectStore>, ObjectPath), UploadError> {
        let fail = |message: String| UploadError::new(&target.bucket, &target.key, message);

        match &self.backend {
            Backend::Fixed(store) => {
                let path = ObjectPath::parse(format!("{}/{}", target.bucket, target.key))
                    .map_err(|e| fail(format!("invalid key: {e}")))?;
                Ok((Arc::clone(store), path))
            }
            Backend::S3 { storage, clients } => {
                let path = ObjectPath::parse(&target.key).map_err(|e| fail(format!("invalid key: {e}")))?;
                if let Some(client) = clients.get(&target.bucket) {
                    return Ok((Arc::clone(client.value()), path));
                }

                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(&target.bucket)
                    .with_allow_http(storage.allow_http);
                if let Some(region) = &storage.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &storage.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let client: Arc<dyn ObjectStore> =
                    Arc::new(builder.build().map_err(|e| fail(format!("cannot build S3 client: {e}")))?);

                debug!(bucket = %target.bucket, "S3 client created");
                let client = clients.entry(target.bucket.clone()).or_insert(client);
                Ok((Arc::clone(client.value()), path))
            }
        }
    }
}

impl fmt::Debug for ObjectStoreBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Backend::S3 { storage, clients } => f
                .debug_struct("ObjectStoreBlobStore")
                .field("backend", &"s3")
                .field("storage", storage)
                .field("cached_clients", &clients.len())
                .finish(),
            Backend::Fixed(store) => f
                .debug_struct("ObjectStoreBlobStore")
                .field("backend", &store.to_string())
                .finish(),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn put_object(&self, local: &Path, target: &UploadTarget) -> Result<u64, UploadError> {
        let fail = |message: String| UploadError::new(&target.bucket, &target.key, message);
        let (store, path) = self.resolve(target)?;

        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| fail(format!("cannot open {}: {e}", local.display())))?;
        let mut writer = BufWriter::new(store, path);

        let copied = tokio::io::copy(&mut file, &mut writer).await;
        let written = match copied {
            Ok(n) => n,
            Err(e) => {
                // Best effort: the multipart upload may not have started yet.
                let _ = writer.abort().await;
                return Err(fail(format!("write failed: {e}")));
            }
        };
        writer
            .shutdown()
            .await
            .map_err(|e| fail(format!("cannot complete upload: {e}")))?;

        info!(target = %target, bytes = written, "artifact uploaded");
        Ok(written)
    }

    async fn get_object(&self, source: &UploadTarget, local: &Path) -> Result<u64, UploadError> {
        let fail = |message: String| UploadError::new(&source.bucket, &source.key, message);
        let (store, path) = self.resolve(source)?;

        let mut stream = store
            .get(&path)
            .await
            .map_err(|e| fail(format!("cannot fetch: {e}")))?
            .into_stream();
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| fail(format!("cannot create {}: {e}", local.display())))?;

        let mut read = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fail(format!("download interrupted: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("cannot write {}: {e}", local.display())))?;
            read += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| fail(format!("cannot write {}: {e}", local.display())))?;

        debug!(source = %source, bytes = read, "object downloaded");
        Ok(read)
    }
}

/// Size and hex SHA-256 of a file.
pub async fn file_digest(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}
