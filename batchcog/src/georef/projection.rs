//! proj4rs-backed georeferencing.

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use super::{GeoreferencingEngine, GridMut, GridRef, Resampling, TargetGeometry};
use crate::errors::ReprojectionError;
use crate::raster::{Bounds, Crs, GeoTransform};

/// Points sampled along each edge when projecting bounds.
const EDGE_SAMPLES: usize = 21;

/// Returns the PROJ.4 definition for a CRS, if the EPSG database knows it.
#[must_use]
pub fn proj_definition(crs: Crs) -> Option<&'static str> {
    u16::try_from(crs.code())
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Returns true if the CRS uses geographic (lon/lat) coordinates.
#[must_use]
pub fn is_geographic(crs: Crs) -> bool {
    proj_definition(crs).map_or_else(
        || crs.code() == 4326 || (4000..5000).contains(&crs.code()),
        |def| def.contains("+proj=longlat"),
    )
}

/// Transforms points between two coordinate reference systems.
pub struct Transformer {
    source: Proj,
    target: Proj,
    source_is_geographic: bool,
    target_is_geographic: bool,
    identity: bool,
}

impl Transformer {
    /// Builds a transformer from `source` to `target`.
    pub fn new(source: Crs, target: Crs) -> Result<Self, ReprojectionError> {
        let lookup = |crs: Crs| {
            let definition = proj_definition(crs)
                .ok_or_else(|| ReprojectionError::new(format!("{crs} is not in the EPSG database")))?;
            Proj::from_proj_string(definition)
                .map_err(|e| ReprojectionError::new(format!("invalid projection {crs}: {e:?}")))
        };

        Ok(Self {
            source: lookup(source)?,
            target: lookup(target)?,
            source_is_geographic: is_geographic(source),
            target_is_geographic: is_geographic(target),
            identity: source == target,
        })
    }

    /// Transforms one point, returning `None` if it falls outside the
    /// target projection's domain.
    #[must_use]
    pub fn transform(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if self.identity {
            return Some((x, y));
        }

        // proj4rs works in radians for geographic coordinates
        let mut point = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.source, &self.target, &mut point).ok()?;

        let (out_x, out_y) = if self.target_is_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        (out_x.is_finite() && out_y.is_finite()).then_some((out_x, out_y))
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("source_is_geographic", &self.source_is_geographic)
            .field("target_is_geographic", &self.target_is_geographic)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// [`GeoreferencingEngine`] built on proj4rs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjEngine;

impl ProjEngine {
    /// Creates a new engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl GeoreferencingEngine for ProjEngine {
    fn compute_target_geometry(
        &self,
        src_crs: Crs,
        dst_crs: Crs,
        width: usize,
        height: usize,
        bounds: &Bounds,
    ) -> Result<TargetGeometry, ReprojectionError> {
        if width == 0 || height == 0 || !bounds.is_valid() {
            return Err(ReprojectionError::new(format!(
                "cannot reproject an empty {width}x{height} raster"
            )));
        }

        let transformer = Transformer::new(src_crs, dst_crs)?;
        let projected = Bounds::enclosing(
            edge_points(bounds).filter_map(|(x, y)| transformer.transform(x, y)),
        );
        if !projected.is_valid() {
            return Err(ReprojectionError::new(format!(
                "source bounds cannot be represented in {dst_crs}"
            )));
        }

        // Keep the pixel count along the diagonal, as GDAL does.
        let diagonal = projected.width().hypot(projected.height());
        let diagonal_pixels = (width as f64).hypot(height as f64);
        let resolution = diagonal / diagonal_pixels;

        let out_width = ((projected.width() / resolution) + 0.5).max(1.0) as usize;
        let out_height = ((projected.height() / resolution) + 0.5).max(1.0) as usize;

        Ok(TargetGeometry {
            transform: GeoTransform::north_up(projected.min_x, projected.max_y, resolution, resolution),
            width: out_width,
            height: out_height,
        })
    }

    fn resample_band(
        &self,
        src: GridRef<'_>,
        dst: GridMut<'_>,
        method: Resampling,
    ) -> Result<(), ReprojectionError> {
        let Resampling::Nearest = method;

        if src.data.len() != src.width * src.height {
            return Err(ReprojectionError::new("source band does not match its grid"));
        }
        if dst.data.len() != dst.width * dst.height {
            return Err(ReprojectionError::new("destination band does not match its grid"));
        }

        // Walk destination pixels and pull the source pixel under each centre.
        let inverse = Transformer::new(dst.crs, src.crs)?;
        for row in 0..dst.height {
            for col in 0..dst.width {
                let (x, y) = dst.transform.apply(col as f64 + 0.5, row as f64 + 0.5);
                let value = inverse
                    .transform(x, y)
                    .and_then(|(sx, sy)| src.transform.invert(sx, sy))
                    .and_then(|(c, r)| pixel_at(&src, c, r))
                    .filter(|v| !is_nodata(*v, src.nodata));
                dst.data[row * dst.width + col] = value.unwrap_or(dst.fill);
            }
        }
        Ok(())
    }
}

fn edge_points(bounds: &Bounds) -> impl Iterator<Item = (f64, f64)> + '_ {
    (0..EDGE_SAMPLES).flat_map(move |i| {
        let f = i as f64 / (EDGE_SAMPLES - 1) as f64;
        let x = bounds.min_x + f * bounds.width();
        let y = bounds.min_y + f * bounds.height();
        [
            (x, bounds.min_y),
            (x, bounds.max_y),
            (bounds.min_x, y),
            (bounds.max_x, y),
        ]
    })
}

fn pixel_at(grid: &GridRef<'_>, col: f64, row: f64) -> Option<f64> {
    if col < 0.0 || row < 0.0 {
        return None;
    }
    let (col, row) = (col.floor() as usize, row.floor() as usize);
    (col < grid.width && row < grid.height).then(|| grid.data[row * grid.width + col])
}

fn is_nodata(value: f64, nodata: Option<f64>) -> bool {
    match nodata {
        Some(nd) if nd.is_nan() => value.is_nan(),
        Some(nd) => value == nd,
        None => false,
    }
}
