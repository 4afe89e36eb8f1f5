//! Input resolution.
//!
//! Inputs may be local paths, `http(s)://` URLs or `s3://bucket/key`
//! objects. Remote inputs are downloaded into the run's workspace so later
//! stages only ever see local files, and are removed with it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::upload::{BlobStore, UploadTarget};
use crate::errors::InputError;
use crate::workspace::WorkspaceHandle;

/// Where an input raster comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLocator {
    /// A file on the local filesystem.
    Local(PathBuf),
    /// An `http://` or `https://` URL.
    Http(String),
    /// An object in blob storage.
    Blob(UploadTarget),
}

impl InputLocator {
    /// Classifies an input string.
    pub fn parse(input: &str) -> Result<Self, InputError> {
        let lower = input.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(Self::Http(input.to_string()));
        }
        if lower.starts_with("s3://") {
            return UploadTarget::parse_url(input)
                .map(Self::Blob)
                .map_err(|e| InputError::new(input, e.message));
        }
        if input.trim().is_empty() {
            return Err(InputError::new(input, "empty input path"));
        }
        Ok(Self::Local(PathBuf::from(input)))
    }
}

impl fmt::Display for InputLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Http(url) => f.write_str(url),
            Self::Blob(target) => write!(f, "s3://{target}"),
        }
    }
}

/// Turns [`InputLocator`]s into local files.
#[derive(Debug, Clone)]
pub struct InputFetcher {
    http: reqwest::Client,
    store: Arc<dyn BlobStore>,
}

impl InputFetcher {
    /// Creates a fetcher. `timeout` bounds each HTTP download.
    pub fn new(store: Arc<dyn BlobStore>, timeout: Duration) -> Result<Self, InputError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("batchcog/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InputError::new("<http client>", e.to_string()))?;
        Ok(Self { http, store })
    }

    /// Returns a local path for `locator`, downloading into `workspace` when
    /// needed.
    pub async fn resolve(&self, locator: &InputLocator, workspace: &WorkspaceHandle) -> Result<PathBuf, InputError> {
        match locator {
            InputLocator::Local(path) => {
                let exists = tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
                if exists {
                    Ok(path.clone())
                } else {
                    Err(InputError::new(locator.to_string(), "no such file"))
                }
            }
            InputLocator::Http(url) => {
                let dest = workspace.new_artifact_path(extension_of(url));
                self.download(url, &dest).await?;
                Ok(dest)
            }
            InputLocator::Blob(target) => {
                let dest = workspace.new_artifact_path(extension_of(&target.key));
                self.store
                    .get_object(target, &dest)
                    .await
                    .map_err(|e| InputError::new(locator.to_string(), e.message))?;
                Ok(dest)
            }
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, InputError> {
        let fail = |message: String| InputError::new(url, message);

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| fail(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| fail(format!("cannot create {}: {e}", dest.display())))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| fail(e.to_string()))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("cannot write {}: {e}", dest.display())))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| fail(format!("cannot write {}: {e}", dest.display())))?;

        debug!(url, bytes = written, "input downloaded");
        Ok(written)
    }
}

/// File extension to keep for a downloaded input, defaulting to `tif`.
fn extension_of(name: &str) -> &str {
    let name = name.split(['?', '#']).next().unwrap_or(name);
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.len() <= 5 => ext,
        _ => "tif",
    }
}
