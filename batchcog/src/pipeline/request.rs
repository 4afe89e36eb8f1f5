//! Run inputs and outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PipelineState;
use crate::stages::encode::EncodingProfile;
use crate::stages::upload::UploadTarget;

/// What one run should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    /// Input rasters, one per output band. Local paths, `http(s)://` URLs or
    /// `s3://bucket/key`.
    pub inputs: Vec<String>,
    /// Where the COG goes.
    pub target: UploadTarget,
    /// Encoding profile; derived from the band count when `None`.
    pub profile: Option<EncodingProfile>,
}

impl PipelineRequest {
    /// A request for any number of single-band inputs.
    pub fn new<I, S>(inputs: I, target: UploadTarget) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            target,
            profile: None,
        }
    }

    /// A single-band request.
    pub fn single_band(input: impl Into<String>, target: UploadTarget) -> Self {
        Self::new([input.into()], target)
    }

    /// A three-band (RGB) request; bands land in the given order.
    pub fn rgb(
        red: impl Into<String>,
        green: impl Into<String>,
        blue: impl Into<String>,
        target: UploadTarget,
    ) -> Self {
        Self::new([red.into(), green.into(), blue.into()], target)
    }

    /// Overrides the encoding profile.
    #[must_use]
    pub fn with_profile(mut self, profile: EncodingProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Number of bands in the output.
    #[must_use]
    pub fn band_count(&self) -> usize {
        self.inputs.len()
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// States visited, from `start` to `done`.
    pub states: Vec<PipelineState>,
    /// Where the COG was written.
    pub target: UploadTarget,
    /// Number of bands in the COG.
    pub bands: usize,
    /// Bytes uploaded.
    pub bytes: u64,
    /// Hex SHA-256 of the uploaded object.
    pub sha256: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}
