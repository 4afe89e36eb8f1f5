//! Raster fixtures.

use std::path::Path;

use crate::errors::RasterIoError;
use crate::raster::{Crs, DataType, GeoTiffDriver, GeoTransform, Raster, RasterDriver, RasterProfile};

/// Row-major ramp from 0 to `max` over a `width` x `height` grid.
#[must_use]
pub fn gradient(width: usize, height: usize, max: f64) -> Vec<f64> {
    let n = width * height;
    if n <= 1 {
        return vec![0.0; n];
    }
    (0..n).map(|i| (i as f64 * max / (n - 1) as f64).round()).collect()
}

/// A single-band `u16` raster over a small area in `crs`.
///
/// Geographic CRSs get a 0.001 degree grid near San Francisco; projected
/// ones a 10 m grid.
///
/// # Panics
///
/// Panics if `data` does not hold `width * height` values.
#[must_use]
pub fn single_band_raster(width: usize, height: usize, crs: Crs, data: Vec<f64>) -> Raster {
    let transform = if crate::georef::is_geographic(crs) {
        GeoTransform::north_up(-122.5, 37.8, 0.001, 0.001)
    } else {
        GeoTransform::north_up(-13_636_000.0, 4_550_000.0, 10.0, 10.0)
    };
    let profile = RasterProfile {
        crs: Some(crs),
        transform,
        width,
        height,
        count: 1,
        dtype: DataType::U16,
        nodata: None,
    };
    match Raster::new(profile, vec![data]) {
        Ok(raster) => raster,
        Err(e) => panic!("bad fixture: {e}"),
    }
}

/// Writes `raster` as a GeoTIFF.
pub fn write_raster(path: &Path, raster: &Raster) -> Result<(), RasterIoError> {
    GeoTiffDriver::new().write(path, raster)
}
