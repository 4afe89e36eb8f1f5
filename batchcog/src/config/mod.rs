//! Pipeline configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Values are layered: JSON file, then `BATCHCOG_*` environment variables,
//! then whatever the caller sets with the `with_*` builders (the CLI maps its
//! flags onto those).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::raster::Crs;
use crate::stages::encode::CogCodec;

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "BATCHCOG_";

/// Top-level configuration for a [`crate::pipeline::CogPipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Parent directory for run workspaces. System temp dir when unset.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
    /// CRS every artifact is reprojected to.
    #[serde(default)]
    pub target_crs: Crs,
    /// External COG encoder invocation.
    #[serde(default)]
    pub encoder: EncoderConfig,
    /// Codec overrides for the default encoding profiles.
    #[serde(default)]
    pub profiles: ProfileOverrides,
    /// Object storage connection settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Timeout for downloading HTTP inputs, in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: f64,
    /// Upper bound on workspace removal, in seconds.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_seconds: f64,
}

fn default_fetch_timeout() -> f64 {
    300.0
}

fn default_cleanup_timeout() -> f64 {
    30.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scratch_root: None,
            target_crs: Crs::default(),
            encoder: EncoderConfig::default(),
            profiles: ProfileOverrides::default(),
            storage: StorageConfig::default(),
            fetch_timeout_seconds: default_fetch_timeout(),
            cleanup_timeout_seconds: default_cleanup_timeout(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with every default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
            .map_err(|e| ConfigError::new(format!("{}: {}", path.display(), e.message)))
    }

    /// Parses a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::new(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `BATCHCOG_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies `BATCHCOG_*` overrides read through `lookup`.
    ///
    /// Recognised variables (without the prefix): `SCRATCH_DIR`,
    /// `TARGET_CRS`, `ENCODER`, `S3_REGION`, `S3_ENDPOINT`, `S3_ALLOW_HTTP`,
    /// `FETCH_TIMEOUT_SECONDS`.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var("SCRATCH_DIR") {
            self.scratch_root = Some(PathBuf::from(dir));
        }
        if let Some(crs) = var("TARGET_CRS") {
            self.target_crs = crs.parse()?;
        }
        if let Some(command) = var("ENCODER") {
            self.encoder = EncoderConfig::from_command_line(&command)?;
        }
        if let Some(region) = var("S3_REGION") {
            self.storage.region = Some(region);
        }
        if let Some(endpoint) = var("S3_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(flag) = var("S3_ALLOW_HTTP") {
            self.storage.allow_http = parse_bool(&flag)
                .ok_or_else(|| ConfigError::new(format!("invalid {ENV_PREFIX}S3_ALLOW_HTTP '{flag}'")))?;
        }
        if let Some(seconds) = var("FETCH_TIMEOUT_SECONDS") {
            self.fetch_timeout_seconds = seconds.trim().parse().map_err(|_| {
                ConfigError::new(format!("invalid {ENV_PREFIX}FETCH_TIMEOUT_SECONDS '{seconds}'"))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.program.trim().is_empty() {
            return Err(ConfigError::new("encoder program must not be empty"));
        }
        for (name, value) in [
            ("fetch_timeout_seconds", self.fetch_timeout_seconds),
            ("cleanup_timeout_seconds", self.cleanup_timeout_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::new(format!("{name} must be a positive number")));
            }
        }
        Ok(())
    }

    /// Sets the scratch root.
    #[must_use]
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Sets the target CRS.
    #[must_use]
    pub fn with_target_crs(mut self, crs: Crs) -> Self {
        self.target_crs = crs;
        self
    }

    /// Sets the encoder invocation.
    #[must_use]
    pub fn with_encoder(mut self, encoder: EncoderConfig) -> Self {
        self.encoder = encoder;
        self
    }

    /// HTTP fetch timeout as a `Duration`.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fetch_timeout_seconds)
    }

    /// Cleanup timeout as a `Duration`.
    #[must_use]
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_timeout_seconds)
    }
}

/// How to invoke the external COG encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Executable name or path.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before `create`.
    #[serde(default = "default_prefix_args")]
    pub prefix_args: Vec<String>,
}

fn default_program() -> String {
    "rio".to_string()
}

fn default_prefix_args() -> Vec<String> {
    vec!["cogeo".to_string()]
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            prefix_args: default_prefix_args(),
        }
    }
}

impl EncoderConfig {
    /// Splits a whitespace-separated command such as `"rio cogeo"`.
    pub fn from_command_line(command: &str) -> Result<Self, ConfigError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ConfigError::new("encoder command must not be empty"))?;
        Ok(Self {
            program,
            prefix_args: parts.collect(),
        })
    }
}

/// Codec overrides for the default encoding profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    /// Codec for single-band artifacts (default deflate).
    #[serde(default)]
    pub single_band_codec: Option<CogCodec>,
    /// Codec for composited artifacts (default webp).
    #[serde(default)]
    pub multi_band_codec: Option<CogCodec>,
}

/// Object storage connection settings.
///
/// Credentials always come from the standard AWS environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Region; falls back to `AWS_REGION`/`AWS_DEFAULT_REGION`.
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Allow plain-HTTP endpoints.
    #[serde(default)]
    pub allow_http: bool,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
