//! Error types for the batchcog pipeline.
//!
//! Every stage has its own error type. They all fold into [`BatchCogError`],
//! which is what the orchestrator hands back to its caller. All of them are
//! fatal for the run that raised them.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience result alias used across the crate.
pub type Result<T, E = BatchCogError> = std::result::Result<T, E>;

/// The main error type for batchcog operations.
#[derive(Debug, Error)]
pub enum BatchCogError {
    /// The scratch workspace could not be created or used.
    #[error("{0}")]
    Workspace(#[from] WorkspaceError),

    /// Bands handed to the compositor do not share a grid.
    #[error("{0}")]
    ShapeMismatch(#[from] ShapeMismatchError),

    /// A band handed to the compositor has no dynamic range.
    #[error("{0}")]
    DegenerateBand(#[from] DegenerateBandError),

    /// Reprojection failed.
    #[error("{0}")]
    Reprojection(#[from] ReprojectionError),

    /// The COG encoder reported a failure.
    #[error("{0}")]
    Encoding(#[from] EncodingError),

    /// The artifact could not be written to the blob store.
    #[error("{0}")]
    Upload(#[from] UploadError),

    /// An input could not be resolved to a local raster.
    #[error("{0}")]
    Input(#[from] InputError),

    /// A raster could not be read or written.
    #[error("{0}")]
    RasterIo(#[from] RasterIoError),

    /// Invalid configuration or invocation.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The pipeline attempted an illegal state transition.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// The run was cancelled at a stage boundary.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A blocking task could not be joined.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchCogError {
    /// Returns a short, stable identifier for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Workspace(_) => "workspace",
            Self::ShapeMismatch(_) => "shape_mismatch",
            Self::DegenerateBand(_) => "degenerate_band",
            Self::Reprojection(_) => "reprojection",
            Self::Encoding(_) => "encoding",
            Self::Upload(_) => "upload",
            Self::Input(_) => "input",
            Self::RasterIo(_) => "raster_io",
            Self::Config(_) => "config",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true if the run ended because of cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<tokio::task::JoinError> for BatchCogError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}

/// Error raised when scratch space cannot be created or removed.
#[derive(Debug, Error)]
#[error("Workspace error at {}: {message}", path.display())]
pub struct WorkspaceError {
    /// The directory involved.
    pub path: PathBuf,
    /// What went wrong.
    pub message: String,
    /// The underlying I/O error, if any.
    #[source]
    pub source: Option<std::io::Error>,
}

impl WorkspaceError {
    /// Creates a new workspace error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying I/O error.
    #[must_use]
    pub fn with_source(mut self, source: std::io::Error) -> Self {
        self.source = Some(source);
        self
    }
}

/// Error raised when composited bands have differing grids.
#[derive(Debug, Clone, Error)]
#[error("Shape mismatch: band {band_index} is {actual}, expected {expected}")]
pub struct ShapeMismatchError {
    /// 1-based index of the offending band.
    pub band_index: usize,
    /// Description of the first band's grid.
    pub expected: String,
    /// Description of the offending band's grid.
    pub actual: String,
}

impl ShapeMismatchError {
    /// Creates a new shape mismatch error.
    #[must_use]
    pub fn new(band_index: usize, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            band_index,
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

/// Error raised when a band has `max == min` and cannot be stretched.
#[derive(Debug, Clone, Error)]
#[error("Degenerate band {band_index}: every pixel is {value}, cannot stretch")]
pub struct DegenerateBandError {
    /// 1-based index of the offending band.
    pub band_index: usize,
    /// The single value present in the band (NaN when the band has no valid pixels).
    pub value: f64,
}

impl DegenerateBandError {
    /// Creates a new degenerate band error.
    #[must_use]
    pub fn new(band_index: usize, value: f64) -> Self {
        Self { band_index, value }
    }
}

/// Error raised when a raster cannot be reprojected.
#[derive(Debug, Clone, Error)]
#[error("Reprojection error: {message}")]
pub struct ReprojectionError {
    /// What went wrong.
    pub message: String,
}

impl ReprojectionError {
    /// Creates a new reprojection error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The source raster carries no coordinate reference system.
    #[must_use]
    pub fn missing_crs() -> Self {
        Self::new("source raster has no coordinate reference system")
    }
}

/// Error raised when the external COG encoder fails.
#[derive(Debug, Clone, Error)]
#[error("Encoding error: {message}{}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
pub struct EncodingError {
    /// What went wrong.
    pub message: String,
    /// Exit code of the encoder process, when it ran to completion.
    pub exit_code: Option<i32>,
    /// Trimmed standard error of the encoder process.
    pub stderr: Option<String>,
}

impl EncodingError {
    /// Creates a new encoding error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Sets the captured standard error.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        if !stderr.trim().is_empty() {
            self.stderr = Some(stderr.trim().to_string());
        }
        self
    }
}

/// Error raised when the blob store rejects or fails an upload.
#[derive(Debug, Clone, Error)]
#[error("Upload error for {bucket}/{key}: {message}")]
pub struct UploadError {
    /// Destination bucket.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// What went wrong.
    pub message: String,
}

impl UploadError {
    /// Creates a new upload error.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Error raised when an input cannot be fetched or opened.
#[derive(Debug, Clone, Error)]
#[error("Input error for '{input}': {message}")]
pub struct InputError {
    /// The input as given by the caller.
    pub input: String,
    /// What went wrong.
    pub message: String,
}

impl InputError {
    /// Creates a new input error.
    #[must_use]
    pub fn new(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            message: message.into(),
        }
    }
}

/// Error raised when a GeoTIFF cannot be read or written.
#[derive(Debug, Clone, Error)]
#[error("Raster I/O error for {}: {message}", path.display())]
pub struct RasterIoError {
    /// The raster path.
    pub path: PathBuf,
    /// What went wrong.
    pub message: String,
}

impl RasterIoError {
    /// Creates a new raster I/O error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error raised for invalid configuration or command-line input.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigError {
    /// What went wrong.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error raised when the pipeline state machine is driven out of order.
#[derive(Debug, Clone, Error)]
#[error("Invalid transition from {from} to {to}")]
pub struct InvalidTransitionError {
    /// The current state.
    pub from: String,
    /// The requested state.
    pub to: String,
}

impl InvalidTransitionError {
    /// Creates a new invalid transition error.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err: BatchCogError = DegenerateBandError::new(2, 0.0).into();
        assert_eq!(err.kind(), "degenerate_band");

        let err: BatchCogError = ReprojectionError::missing_crs().into();
        assert_eq!(err.kind(), "reprojection");
        assert!(err.to_string().contains("no coordinate reference system"));

        let err = BatchCogError::Cancelled("ctrl-c".to_string());
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_encoding_error_display() {
        let err = EncodingError::new("encoder failed")
            .with_exit_code(Some(2))
            .with_stderr("  bad profile \n");

        assert_eq!(err.to_string(), "Encoding error: encoder failed (exit code 2)");
        assert_eq!(err.stderr.as_deref(), Some("bad profile"));
    }

    #[test]
    fn test_encoding_error_ignores_blank_stderr() {
        let err = EncodingError::new("x").with_stderr("   ");
        assert!(err.stderr.is_none());
        assert_eq!(err.to_string(), "Encoding error: x");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = ShapeMismatchError::new(3, "100x100", "50x100");
        assert_eq!(err.to_string(), "Shape mismatch: band 3 is 50x100, expected 100x100");
    }

    #[test]
    fn test_upload_error_display() {
        let err = UploadError::new("cogs", "a/b.tif", "access denied");
        assert_eq!(err.to_string(), "Upload error for cogs/a/b.tif: access denied");
    }
}
