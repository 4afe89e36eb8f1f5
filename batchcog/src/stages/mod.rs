//! Pipeline stages.
//!
//! Each stage is usable on its own; [`crate::pipeline::CogPipeline`] strings
//! them together.

pub mod composite;
pub mod encode;
pub mod fetch;
pub mod reproject;
pub mod upload;

pub use composite::{composite, linear_stretch};
pub use encode::{CogCodec, CogEncoder, EncodingProfile, RioCogeoEncoder};
pub use fetch::{InputFetcher, InputLocator};
pub use reproject::Reprojector;
pub use upload::{file_digest, BlobStore, ObjectStoreBlobStore, UploadTarget};
