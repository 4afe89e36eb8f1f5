//! Band compositing with per-band linear stretch.

use tracing::debug;

use crate::errors::{DegenerateBandError, Result, ShapeMismatchError};
use crate::raster::{DataType, Raster, RasterDriver, RasterSource};

/// Stacks single-band rasters into one 8-bit multi-band raster.
///
/// Band `i` of the output (1-based) is input `i` stretched onto `[0, 255]`.
/// Every input is loaded and checked against the first before anything is
/// stretched, so a bad set of inputs fails without producing output. Only
/// the first band of each input is used.
///
/// The output profile comes from the first input with dtype `u8` and one
/// band per input. Its nodata is kept only when it is an integer that fits
/// in a byte.
pub fn composite(bands: &[RasterSource], driver: &dyn RasterDriver) -> Result<RasterSource> {
    let loaded = bands
        .iter()
        .map(|source| source.load(driver))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let Some(first) = loaded.first() else {
        return Err(ShapeMismatchError::new(1, "at least one band", "no bands").into());
    };
    let reference = first.profile().clone();

    for (idx, raster) in loaded.iter().enumerate().skip(1) {
        if !raster.profile().same_grid(&reference) {
            return Err(ShapeMismatchError::new(
                idx + 1,
                reference.grid_summary(),
                raster.profile().grid_summary(),
            )
            .into());
        }
    }

    let mut profile = reference;
    profile.dtype = DataType::U8;
    profile.count = loaded.len();
    profile.nodata = profile.nodata.filter(|nd| DataType::U8.can_represent(*nd));

    let mut output = Raster::filled(profile, 0.0);
    for (idx, raster) in loaded.iter().enumerate() {
        let band = raster.band(1).unwrap_or_default();
        let stretched = linear_stretch(band).map_err(|e| DegenerateBandError::new(idx + 1, e.value))?;
        output.write_band(idx + 1, stretched)?;
    }

    debug!(bands = output.profile().count, grid = %output.profile().grid_summary(), "bands composited");
    Ok(RasterSource::memory(output))
}

/// Returns the finite minimum and maximum of `values`, skipping NaN.
#[must_use]
pub fn band_range(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Maps `[min, max]` of `band` linearly onto `[0, 255]`, truncating.
///
/// NaN pixels become 0. The band index in the returned error is always 1;
/// callers that know the real position rewrap it.
pub fn linear_stretch(band: &[f64]) -> std::result::Result<Vec<f64>, DegenerateBandError> {
    let (min, max) = band_range(band).ok_or_else(|| DegenerateBandError::new(1, f64::NAN))?;
    let range = max - min;
    if range == 0.0 || !range.is_finite() {
        return Err(DegenerateBandError::new(1, min));
    }

    Ok(band
        .iter()
        .map(|&v| {
            if v.is_nan() {
                0.0
            } else {
                ((v - min) / range * 255.0).trunc().clamp(0.0, 255.0)
            }
        })
        .collect())
}
