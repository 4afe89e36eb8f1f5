//! COG encoding through an external converter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EncoderConfig;
use crate::errors::{ConfigError, EncodingError};

/// Compression profile passed to `--cog-profile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CogCodec {
    /// Lossless deflate.
    Deflate,
    /// Lossy WebP.
    Webp,
    /// Lossy JPEG.
    Jpeg,
    /// Lossless Zstandard.
    Zstd,
    /// Lossless LZW.
    Lzw,
    /// Lossless PackBits.
    Packbits,
    /// Lossless LZMA.
    Lzma,
    /// No compression.
    Raw,
}

impl CogCodec {
    /// Name understood by the encoder.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deflate => "deflate",
            Self::Webp => "webp",
            Self::Jpeg => "jpeg",
            Self::Zstd => "zstd",
            Self::Lzw => "lzw",
            Self::Packbits => "packbits",
            Self::Lzma => "lzma",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for CogCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CogCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deflate" => Ok(Self::Deflate),
            "webp" => Ok(Self::Webp),
            "jpeg" => Ok(Self::Jpeg),
            "zstd" => Ok(Self::Zstd),
            "lzw" => Ok(Self::Lzw),
            "packbits" => Ok(Self::Packbits),
            "lzma" => Ok(Self::Lzma),
            "raw" => Ok(Self::Raw),
            other => Err(ConfigError::new(format!("unknown COG codec '{other}'"))),
        }
    }
}

/// Options for one encoder invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingProfile {
    /// Compression codec.
    pub codec: CogCodec,
    /// 1-based bands to include; empty means all.
    pub band_indexes: Vec<usize>,
    /// Emit an alpha mask band.
    pub add_mask: bool,
    /// Align tiling to web map zoom levels.
    pub web_optimized: bool,
    /// Nodata value written to the output.
    pub nodata: i64,
}

impl EncodingProfile {
    /// Lossless single-band output.
    #[must_use]
    pub fn single_band() -> Self {
        Self {
            codec: CogCodec::Deflate,
            band_indexes: vec![1],
            add_mask: false,
            web_optimized: true,
            nodata: 0,
        }
    }

    /// Lossy RGB output with an alpha mask.
    #[must_use]
    pub fn rgb() -> Self {
        Self::multi_band(3)
    }

    /// Lossy N-band output with an alpha mask.
    #[must_use]
    pub fn multi_band(count: usize) -> Self {
        Self {
            codec: CogCodec::Webp,
            band_indexes: (1..=count).collect(),
            add_mask: true,
            web_optimized: true,
            nodata: 0,
        }
    }

    /// Default profile for a raster with `count` bands.
    #[must_use]
    pub fn for_band_count(count: usize) -> Self {
        if count <= 1 {
            Self::single_band()
        } else {
            Self::multi_band(count)
        }
    }

    /// Replaces the codec.
    #[must_use]
    pub fn with_codec(mut self, codec: CogCodec) -> Self {
        self.codec = codec;
        self
    }

    /// `--bidx` value, or `None` when every band is used.
    #[must_use]
    pub fn bidx(&self) -> Option<String> {
        if self.band_indexes.is_empty() {
            return None;
        }
        Some(
            self.band_indexes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Converts a GeoTIFF into a Cloud-Optimized GeoTIFF.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CogEncoder: Send + Sync + fmt::Debug {
    /// Encodes `src` into `dst`. Must fail if `dst` was not produced.
    async fn encode(&self, src: &Path, dst: &Path, profile: &EncodingProfile) -> Result<(), EncodingError>;
}

/// Runs `rio cogeo create` (or a compatible command) as a child process.
#[derive(Debug, Clone, Default)]
pub struct RioCogeoEncoder {
    config: EncoderConfig,
}

impl RioCogeoEncoder {
    /// Creates an encoder from its invocation settings.
    #[must_use]
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    /// The program that will be spawned.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.config.program
    }

    /// Arguments passed to the program, after any prefix arguments.
    #[must_use]
    pub fn command_args(&self, src: &Path, dst: &Path, profile: &EncodingProfile) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.config.prefix_args.iter().map(OsString::from).collect();
        args.push("create".into());
        args.push(src.as_os_str().to_owned());
        args.push(dst.as_os_str().to_owned());
        args.push("--cog-profile".into());
        args.push(profile.codec.as_str().into());
        if let Some(bidx) = profile.bidx() {
            args.push("--bidx".into());
            args.push(bidx.into());
        }
        args.push("--nodata".into());
        args.push(profile.nodata.to_string().into());
        if profile.add_mask {
            args.push("--add-mask".into());
        }
        if profile.web_optimized {
            args.push("--web-optimized".into());
        }
        args
    }
}

#[async_trait]
impl CogEncoder for RioCogeoEncoder {
    async fn encode(&self, src: &Path, dst: &Path, profile: &EncodingProfile) -> Result<(), EncodingError> {
        let args = self.command_args(src, dst, profile);
        debug!(program = %self.config.program, ?args, "running COG encoder");

        let output = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EncodingError::new(format!("cannot run '{}': {e}", self.config.program)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(EncodingError::new(format!("'{}' failed", self.config.program))
                .with_exit_code(output.status.code())
                .with_stderr(stderr));
        }
        if !stderr.trim().is_empty() {
            warn!(program = %self.config.program, stderr = %stderr.trim(), "COG encoder wrote to stderr");
        }

        match tokio::fs::metadata(dst).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(EncodingError::new(format!(
                "'{}' exited successfully but produced no output at {}",
                self.config.program,
                dst.display()
            ))
            .with_exit_code(output.status.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn args_as_strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn test_default_profiles() {
        let single = EncodingProfile::single_band();
        assert_eq!(single.codec, CogCodec::Deflate);
        assert_eq!(single.band_indexes, vec![1]);
        assert!(!single.add_mask);
        assert!(single.web_optimized);
        assert_eq!(single.nodata, 0);

        let rgb = EncodingProfile::rgb();
        assert_eq!(rgb.codec, CogCodec::Webp);
        assert_eq!(rgb.band_indexes, vec![1, 2, 3]);
        assert!(rgb.add_mask);
        assert_eq!(EncodingProfile::for_band_count(3), rgb);
        assert_eq!(EncodingProfile::for_band_count(1), single);
    }

    #[test]
    fn test_single_band_arguments() {
        let encoder = RioCogeoEncoder::default();
        let args = encoder.command_args(
            Path::new("/w/in.tif"),
            Path::new("/w/out.tif"),
            &EncodingProfile::single_band(),
        );

        assert_eq!(encoder.program(), "rio");
        assert_eq!(
            args_as_strings(args),
            vec![
                "cogeo", "create", "/w/in.tif", "/w/out.tif", "--cog-profile", "deflate", "--bidx", "1",
                "--nodata", "0", "--web-optimized",
            ]
        );
    }

    #[test]
    fn test_rgb_arguments() {
        let encoder = RioCogeoEncoder::new(EncoderConfig {
            program: "cogger".to_string(),
            prefix_args: vec![],
        });
        let args = encoder.command_args(Path::new("a.tif"), Path::new("b.tif"), &EncodingProfile::rgb());

        assert_eq!(
            args_as_strings(args),
            vec![
                "create", "a.tif", "b.tif", "--cog-profile", "webp", "--bidx", "1,2,3", "--nodata", "0",
                "--add-mask", "--web-optimized",
            ]
        );
    }

    #[test]
    fn test_empty_band_list_omits_bidx() {
        let mut profile = EncodingProfile::single_band().with_codec(CogCodec::Zstd);
        profile.band_indexes.clear();
        profile.web_optimized = false;
        let args = args_as_strings(RioCogeoEncoder::default().command_args(
            Path::new("a"),
            Path::new("b"),
            &profile,
        ));
        assert!(!args.contains(&"--bidx".to_string()));
        assert!(!args.contains(&"--web-optimized".to_string()));
        assert!(args.contains(&"zstd".to_string()));
    }

    #[test]
    fn test_codec_parse() {
        assert_eq!("WEBP".parse::<CogCodec>().unwrap(), CogCodec::Webp);
        assert!("png".parse::<CogCodec>().is_err());
        assert_eq!(CogCodec::Packbits.to_string(), "packbits");
    }

    #[tokio::test]
    async fn test_missing_program_is_encoding_error() {
        let encoder = RioCogeoEncoder::new(EncoderConfig {
            program: "batchcog-no-such-encoder".to_string(),
            prefix_args: vec![],
        });
        let err = encoder
            .encode(Path::new("in.tif"), Path::new("out.tif"), &EncodingProfile::single_band())
            .await
            .unwrap_err();
        assert!(err.message.contains("cannot run"));
        assert_eq!(err.exit_code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_encoding_error() {
        let encoder = RioCogeoEncoder::new(EncoderConfig {
            program: "sh".to_string(),
            prefix_args: vec!["-c".to_string(), "echo 'bad input' >&2; exit 3".to_string()],
        });
        let err = encoder
            .encode(Path::new("in.tif"), Path::new("out.tif"), &EncodingProfile::single_band())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert_eq!(err.stderr.as_deref(), Some("bad input"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_without_output_is_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let dst: PathBuf = dir.path().join("never-written.tif");
        let encoder = RioCogeoEncoder::new(EncoderConfig {
            program: "true".to_string(),
            prefix_args: vec![],
        });
        let err = encoder
            .encode(Path::new("in.tif"), &dst, &EncodingProfile::single_band())
            .await
            .unwrap_err();
        assert!(err.message.contains("produced no output"));
        assert_eq!(err.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.tif");
        let dst = dir.path().join("out.tif");
        std::fs::write(&src, b"tiff").unwrap();

        // `sh -c 'cp "$2" "$3"' sh create <src> <dst> ...`
        let encoder = RioCogeoEncoder::new(EncoderConfig {
            program: "sh".to_string(),
            prefix_args: vec!["-c".to_string(), r#"cp "$2" "$3""#.to_string(), "sh".to_string()],
        });
        encoder
            .encode(&src, &dst, &EncodingProfile::single_band())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"tiff");
    }

    #[tokio::test]
    async fn test_mock_encoder() {
        let mut mock = MockCogEncoder::new();
        mock.expect_encode()
            .withf(|_, _, profile| profile.codec == CogCodec::Webp)
            .times(1)
            .returning(|_, _, _| Err(EncodingError::new("mocked")));

        let err = mock
            .encode(Path::new("a"), Path::new("b"), &EncodingProfile::rgb())
            .await
            .unwrap_err();
        assert_eq!(err.message, "mocked");
    }
}
