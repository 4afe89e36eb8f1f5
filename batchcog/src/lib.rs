//! # batchcog
//!
//! Turns raw georeferenced raster tiles into Cloud-Optimized GeoTIFFs and
//! uploads them to object storage.
//!
//! A run resolves its inputs, stacks multi-band inputs into one 8-bit raster
//! with a per-band linear stretch, reprojects into the target CRS (EPSG:3857
//! by default), hands the result to an external COG encoder and uploads the
//! COG. Every intermediate file lives in a per-run scratch workspace that is
//! removed when the run ends, whether it succeeded or not.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use batchcog::prelude::*;
//!
//! let pipeline = CogPipeline::builder(PipelineConfig::default()).build()?;
//! let request = PipelineRequest::rgb(
//!     "b4.tif",
//!     "b3.tif",
//!     "b2.tif",
//!     UploadTarget::parse_url("s3://cogs/scenes/rgb.tif")?,
//! );
//! let report = pipeline.run(request, &CancellationToken::new()).await?;
//! println!("uploaded {} bytes", report.bytes);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod georef;
pub mod observability;
pub mod pipeline;
pub mod raster;
pub mod stages;
pub mod testing;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EncoderConfig, PipelineConfig, StorageConfig};
    pub use crate::errors::{BatchCogError, Result};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::georef::{GeoreferencingEngine, ProjEngine};
    pub use crate::pipeline::{CogPipeline, PipelineRequest, PipelineState, RunReport};
    pub use crate::raster::{Crs, GeoTiffDriver, Raster, RasterDriver, RasterProfile, RasterSource};
    pub use crate::stages::{
        BlobStore, CogCodec, CogEncoder, EncodingProfile, ObjectStoreBlobStore, RioCogeoEncoder,
        UploadTarget,
    };
    pub use crate::workspace::ScratchWorkspace;
}
