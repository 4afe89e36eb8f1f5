//! Test doubles and raster fixtures.
//!
//! These let a [`crate::pipeline::CogPipeline`] run end to end without the
//! external encoder or a real object store.

mod fakes;
mod fixtures;

pub use fakes::{FailingEncoder, PassthroughEncoder, RecordingBlobStore};
pub use fixtures::{gradient, single_band_raster, write_raster};
