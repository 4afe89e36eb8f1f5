//! `batch-cog`: convert raster tiles to COGs and upload them.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;

use batchcog::cancellation::CancellationToken;
use batchcog::config::{EncoderConfig, PipelineConfig};
use batchcog::errors::BatchCogError;
use batchcog::events::LoggingEventSink;
use batchcog::observability::{init_tracing, LogFormat};
use batchcog::pipeline::{CogPipeline, PipelineRequest, RunReport};
use batchcog::raster::Crs;
use batchcog::stages::UploadTarget;

/// Exit code for a run stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "batch-cog")]
#[command(author, version, about = "Convert raster tiles to Cloud-Optimized GeoTIFFs", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Parent directory for per-run scratch space
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    /// Output CRS, e.g. EPSG:3857
    #[arg(long, global = true)]
    target_crs: Option<Crs>,

    /// Encoder command, e.g. "rio cogeo"
    #[arg(long, global = true)]
    encoder: Option<String>,

    /// Log output format: text or json
    #[arg(long, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one single-band raster
    #[command(name = "create-1band", alias = "create-1band-cog")]
    Create1Band {
        /// Input raster (path, http(s) URL or s3://bucket/key)
        input: String,
        /// Destination, s3://bucket/key
        output: String,
    },
    /// Stretch three single-band rasters into one RGB COG
    #[command(name = "create-3band", alias = "create-3band-cog")]
    Create3Band {
        /// Red band
        band1: String,
        /// Green band
        band2: String,
        /// Blue band
        band3: String,
        /// Destination, s3://bucket/key
        output: String,
    },
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    }
    .apply_env()?;

    if let Some(dir) = &cli.scratch_dir {
        config = config.with_scratch_root(dir);
    }
    if let Some(crs) = cli.target_crs {
        config = config.with_target_crs(crs);
    }
    if let Some(command) = &cli.encoder {
        config = config.with_encoder(EncoderConfig::from_command_line(command)?);
    }
    config.validate()?;
    Ok(config)
}

fn build_request(command: Commands) -> Result<PipelineRequest> {
    let request = match command {
        Commands::Create1Band { input, output } => {
            PipelineRequest::single_band(input, UploadTarget::parse_url(&output)?)
        }
        Commands::Create3Band {
            band1,
            band2,
            band3,
            output,
        } => PipelineRequest::rgb(band1, band2, band3, UploadTarget::parse_url(&output)?),
    };
    Ok(request)
}

async fn run(cli: Cli) -> Result<RunReport> {
    let config = load_config(&cli)?;
    let request = build_request(cli.command)?;

    let pipeline = CogPipeline::builder(config)
        .event_sink(Arc::new(LoggingEventSink::debug()))
        .build()?;

    let token = Arc::new(CancellationToken::new());
    let on_signal = Arc::clone(&token);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next stage boundary");
            on_signal.cancel("interrupted");
        }
    });

    Ok(pipeline.run(request, &token).await?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_format, cli.verbose) {
        eprintln!("warning: {e}");
    }

    match run(cli).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("uploaded {} bytes to {}", report.bytes, report.target),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            let cancelled = e
                .downcast_ref::<BatchCogError>()
                .is_some_and(BatchCogError::is_cancelled);
            if cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create_3band_alias() {
        let cli = Cli::try_parse_from([
            "batch-cog",
            "create-3band-cog",
            "r.tif",
            "g.tif",
            "b.tif",
            "s3://cogs/rgb.tif",
            "--target-crs",
            "EPSG:4326",
        ])
        .unwrap();
        assert_eq!(cli.target_crs, Some(Crs::WGS84));

        let request = build_request(cli.command).unwrap();
        assert_eq!(request.inputs, vec!["r.tif", "g.tif", "b.tif"]);
        assert_eq!(request.target, UploadTarget::new("cogs", "rgb.tif"));
    }

    #[test]
    fn test_bad_output_url_is_rejected() {
        let cli = Cli::try_parse_from(["batch-cog", "create-1band", "in.tif", "s3://cogs"]).unwrap();
        assert!(build_request(cli.command).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "batch-cog",
            "--scratch-dir",
            "/tmp/scratch",
            "--encoder",
            "/opt/rio cogeo",
            "--log-format",
            "json",
            "create-1band",
            "in.tif",
            "s3://cogs/out.tif",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);

        let config = load_config(&cli).unwrap();
        assert_eq!(config.scratch_root, Some(PathBuf::from("/tmp/scratch")));
        assert_eq!(config.encoder.program, "/opt/rio");
    }
}
