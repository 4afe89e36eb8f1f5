//! Fake encoders and blob stores.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{EncodingError, UploadError};
use crate::raster::{GeoTiffDriver, Raster, RasterDriver};
use crate::stages::encode::{CogEncoder, EncodingProfile};
use crate::stages::upload::{BlobStore, UploadTarget};

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Encoder that rewrites its input unchanged, plus an alpha band when the
/// profile asks for a mask.
///
/// The alpha band is 255 where any band is non-zero and 0 elsewhere.
pub struct PassthroughEncoder {
    driver: Arc<dyn RasterDriver>,
    calls: Mutex<Vec<(PathBuf, PathBuf, EncodingProfile)>>,
    hook: Option<Hook>,
}

impl Default for PassthroughEncoder {
    fn default() -> Self {
        Self::new(Arc::new(GeoTiffDriver::new()))
    }
}

impl PassthroughEncoder {
    /// Creates an encoder that reads and writes through `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn RasterDriver>) -> Self {
        Self {
            driver,
            calls: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Runs `hook` at the start of every encode.
    #[must_use]
    pub fn with_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Every `(src, dst, profile)` seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(PathBuf, PathBuf, EncodingProfile)> {
        self.calls.lock().clone()
    }
}

impl fmt::Debug for PassthroughEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughEncoder")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

fn with_mask(raster: Raster) -> Result<Raster, EncodingError> {
    let (mut profile, mut bands) = raster.into_parts();
    let alpha: Vec<f64> = (0..profile.pixel_count())
        .map(|i| if bands.iter().any(|b| b[i] != 0.0) { 255.0 } else { 0.0 })
        .collect();
    bands.push(alpha);
    profile.count += 1;
    Raster::new(profile, bands).map_err(|e| EncodingError::new(e.to_string()))
}

#[async_trait]
impl CogEncoder for PassthroughEncoder {
    async fn encode(&self, src: &Path, dst: &Path, profile: &EncodingProfile) -> Result<(), EncodingError> {
        if let Some(hook) = &self.hook {
            hook();
        }
        self.calls
            .lock()
            .push((src.to_path_buf(), dst.to_path_buf(), profile.clone()));

        let driver = Arc::clone(&self.driver);
        let (src, dst, add_mask) = (src.to_path_buf(), dst.to_path_buf(), profile.add_mask);
        tokio::task::spawn_blocking(move || {
            let raster = driver.read(&src).map_err(|e| EncodingError::new(e.to_string()))?;
            let raster = if add_mask { with_mask(raster)? } else { raster };
            driver
                .write(&dst, &raster)
                .map_err(|e| EncodingError::new(e.to_string()))
        })
        .await
        .map_err(|e| EncodingError::new(format!("encoder task failed: {e}")))?
    }
}

/// Encoder that always fails as a crashed converter would.
#[derive(Debug, Clone)]
pub struct FailingEncoder {
    exit_code: i32,
    stderr: String,
}

impl FailingEncoder {
    /// Fails with `exit_code` and `stderr`.
    #[must_use]
    pub fn new(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
impl CogEncoder for FailingEncoder {
    async fn encode(&self, _src: &Path, dst: &Path, _profile: &EncodingProfile) -> Result<(), EncodingError> {
        // Leave a partial file behind, like an interrupted converter.
        let _ = tokio::fs::write(dst, b"partial").await;
        Err(EncodingError::new("fake encoder failed")
            .with_exit_code(Some(self.exit_code))
            .with_stderr(self.stderr.clone()))
    }
}

/// In-memory blob store that records every upload.
#[derive(Debug, Default)]
pub struct RecordingBlobStore {
    objects: Mutex<HashMap<UploadTarget, Vec<u8>>>,
    puts: Mutex<Vec<UploadTarget>>,
    fail_puts: Mutex<Option<String>>,
}

impl RecordingBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `put_object` fail with `message`.
    pub fn fail_puts(&self, message: impl Into<String>) {
        *self.fail_puts.lock() = Some(message.into());
    }

    /// Stores `bytes` at `target`, as if uploaded earlier.
    pub fn insert(&self, target: UploadTarget, bytes: Vec<u8>) {
        self.objects.lock().insert(target, bytes);
    }

    /// The object at `target`, if any.
    #[must_use]
    pub fn object(&self, target: &UploadTarget) -> Option<Vec<u8>> {
        self.objects.lock().get(target).cloned()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Targets of every attempted upload, in order.
    #[must_use]
    pub fn puts(&self) -> Vec<UploadTarget> {
        self.puts.lock().clone()
    }
}

#[async_trait]
impl BlobStore for RecordingBlobStore {
    async fn put_object(&self, local: &Path, target: &UploadTarget) -> Result<u64, UploadError> {
        self.puts.lock().push(target.clone());
        if let Some(message) = self.fail_puts.lock().clone() {
            return Err(UploadError::new(&target.bucket, &target.key, message));
        }

        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| UploadError::new(&target.bucket, &target.key, e.to_string()))?;
        let len = bytes.len() as u64;
        self.objects.lock().insert(target.clone(), bytes);
        Ok(len)
    }

    async fn get_object(&self, source: &UploadTarget, local: &Path) -> Result<u64, UploadError> {
        let bytes = self
            .object(source)
            .ok_or_else(|| UploadError::new(&source.bucket, &source.key, "no such object"))?;
        tokio::fs::write(local, &bytes)
            .await
            .map_err(|e| UploadError::new(&source.bucket, &source.key, e.to_string()))?;
        Ok(bytes.len() as u64)
    }
}
