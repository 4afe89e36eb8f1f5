//! Georeferencing engine.
//!
//! The reprojection stage only talks to [`GeoreferencingEngine`]. The default
//! implementation, [`ProjEngine`], uses proj4rs with the EPSG database from
//! crs-definitions, so no system PROJ/GDAL install is needed.

mod projection;

pub use projection::{is_geographic, proj_definition, ProjEngine, Transformer};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ReprojectionError;
use crate::raster::{Bounds, Crs, GeoTransform};

/// Resampling method used when warping pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    /// Nearest neighbour: fast, never invents values. Unsuitable where smooth
    /// gradients are required.
    #[default]
    Nearest,
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => write!(f, "nearest"),
        }
    }
}

/// Destination grid computed for a reprojection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetGeometry {
    /// Destination transform.
    pub transform: GeoTransform,
    /// Destination width in pixels.
    pub width: usize,
    /// Destination height in pixels.
    pub height: usize,
}

/// A band grid together with its georeferencing.
#[derive(Debug, Clone, Copy)]
pub struct GridRef<'a> {
    /// Row-major pixel values.
    pub data: &'a [f64],
    /// Grid width in pixels.
    pub width: usize,
    /// Grid height in pixels.
    pub height: usize,
    /// Pixel-to-world transform.
    pub transform: &'a GeoTransform,
    /// CRS of the grid.
    pub crs: Crs,
    /// Nodata sentinel in `data`.
    pub nodata: Option<f64>,
}

/// A mutable destination grid.
#[derive(Debug)]
pub struct GridMut<'a> {
    /// Row-major pixel values, pre-filled with `fill`.
    pub data: &'a mut [f64],
    /// Grid width in pixels.
    pub width: usize,
    /// Grid height in pixels.
    pub height: usize,
    /// Pixel-to-world transform.
    pub transform: &'a GeoTransform,
    /// CRS of the grid.
    pub crs: Crs,
    /// Value written where no source pixel applies.
    pub fill: f64,
}

/// Coordinate reprojection primitives.
///
/// Implementations must be safe to share between concurrent runs.
pub trait GeoreferencingEngine: Send + Sync + fmt::Debug {
    /// Computes the best-fit transform and minimal covering size needed to
    /// represent `bounds` (in `src_crs`, covering a `width` x `height` grid)
    /// in `dst_crs`.
    fn compute_target_geometry(
        &self,
        src_crs: Crs,
        dst_crs: Crs,
        width: usize,
        height: usize,
        bounds: &Bounds,
    ) -> Result<TargetGeometry, ReprojectionError>;

    /// Resamples one band from `src` into `dst`.
    fn resample_band(
        &self,
        src: GridRef<'_>,
        dst: GridMut<'_>,
        method: Resampling,
    ) -> Result<(), ReprojectionError>;
}
