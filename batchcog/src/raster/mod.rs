//! Raster data model.
//!
//! A [`RasterSource`] is either a GeoTIFF on disk or a [`Raster`] held in
//! memory. Both carry a [`RasterProfile`]: the metadata needed to create a
//! new raster with the same grid.

mod geotiff;

pub use geotiff::{GeoTiffDriver, RasterDriver};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{ConfigError, RasterIoError};

/// A coordinate reference system identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    epsg: u32,
}

impl Crs {
    /// WGS 84 geographic coordinates.
    pub const WGS84: Self = Self { epsg: 4326 };
    /// Web Mercator, the default output CRS.
    pub const WEB_MERCATOR: Self = Self { epsg: 3857 };

    /// Creates a CRS from an EPSG code.
    #[must_use]
    pub const fn epsg(code: u32) -> Self {
        Self { epsg: code }
    }

    /// Returns the EPSG code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        self.epsg
    }
}

impl Default for Crs {
    fn default() -> Self {
        Self::WEB_MERCATOR
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

impl FromStr for Crs {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        digits
            .parse::<u32>()
            .ok()
            .filter(|code| *code > 0)
            .map(Self::epsg)
            .ok_or_else(|| ConfigError::new(format!("invalid CRS '{s}', expected EPSG:<code>")))
    }
}

impl TryFrom<String> for Crs {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}

/// GDAL-ordered affine transform from pixel to world coordinates.
///
/// `x = origin_x + col * pixel_width + row * row_rotation`,
/// `y = origin_y + col * col_rotation + row * pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// World X of the top-left corner.
    pub origin_x: f64,
    /// Pixel width in world units.
    pub pixel_width: f64,
    /// Row rotation term.
    pub row_rotation: f64,
    /// World Y of the top-left corner.
    pub origin_y: f64,
    /// Column rotation term.
    pub col_rotation: f64,
    /// Pixel height in world units (negative for north-up).
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Creates a north-up transform.
    #[must_use]
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    /// Returns true if the transform has no rotation terms.
    #[must_use]
    pub fn is_north_up(&self) -> bool {
        self.row_rotation == 0.0 && self.col_rotation == 0.0
    }

    /// Maps a (fractional) pixel position to world coordinates.
    #[must_use]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Maps world coordinates back to a fractional pixel position.
    ///
    /// Returns `None` for a singular transform.
    #[must_use]
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        let col = (dx * self.pixel_height - dy * self.row_rotation) / det;
        let row = (dy * self.pixel_width - dx * self.col_rotation) / det;
        Some((col, row))
    }

    /// Returns the bounds covered by a `width` x `height` grid.
    #[must_use]
    pub fn bounds(&self, width: usize, height: usize) -> Bounds {
        let (w, h) = (width as f64, height as f64);
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(0.0, h),
            self.apply(w, h),
        ];
        Bounds::enclosing(corners.iter().copied())
    }
}

/// An axis-aligned bounding box in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Minimum X.
    pub min_x: f64,
    /// Minimum Y.
    pub min_y: f64,
    /// Maximum X.
    pub max_x: f64,
    /// Maximum Y.
    pub max_y: f64,
}

impl Bounds {
    /// Creates new bounds.
    #[must_use]
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Returns the smallest bounds enclosing every finite point.
    #[must_use]
    pub fn enclosing(points: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut bounds = Self::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in points {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            bounds.min_x = bounds.min_x.min(x);
            bounds.min_y = bounds.min_y.min(y);
            bounds.max_x = bounds.max_x.max(x);
            bounds.max_y = bounds.max_y.max(y);
        }
        bounds
    }

    /// Returns the width of the box.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Returns the height of the box.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Returns true if the box has a finite, positive area.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.width().is_finite() && self.height().is_finite() && self.width() > 0.0 && self.height() > 0.0
    }
}

/// Per-band pixel data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 8-bit.
    U8,
    /// Unsigned 16-bit.
    U16,
    /// Signed 16-bit.
    I16,
    /// Unsigned 32-bit.
    U32,
    /// Signed 32-bit.
    I32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl DataType {
    /// Size of one sample in bytes.
    #[must_use]
    pub fn size_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Returns true if `value` is exactly representable in this type.
    #[must_use]
    pub fn can_represent(self, value: f64) -> bool {
        let in_range = |lo: f64, hi: f64| value.fract() == 0.0 && value >= lo && value <= hi;
        match self {
            Self::U8 => in_range(0.0, f64::from(u8::MAX)),
            Self::U16 => in_range(0.0, f64::from(u16::MAX)),
            Self::I16 => in_range(f64::from(i16::MIN), f64::from(i16::MAX)),
            Self::U32 => in_range(0.0, f64::from(u32::MAX)),
            Self::I32 => in_range(f64::from(i32::MIN), f64::from(i32::MAX)),
            Self::F32 | Self::F64 => true,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::I16 => "int16",
            Self::U32 => "uint32",
            Self::I32 => "int32",
            Self::F32 => "float32",
            Self::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Metadata needed to create a raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterProfile {
    /// Coordinate reference system, if the raster is georeferenced.
    pub crs: Option<Crs>,
    /// Pixel-to-world transform.
    pub transform: GeoTransform,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Number of bands.
    pub count: usize,
    /// Sample type shared by all bands.
    pub dtype: DataType,
    /// Nodata sentinel.
    pub nodata: Option<f64>,
}

impl RasterProfile {
    /// Number of pixels in one band.
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Bounds of the raster in its own CRS.
    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.width, self.height)
    }

    /// Short description of the grid, used in error messages.
    #[must_use]
    pub fn grid_summary(&self) -> String {
        let crs = self.crs.map_or_else(|| "no CRS".to_string(), |c| c.to_string());
        format!("{}x{} ({crs})", self.width, self.height)
    }

    /// Returns true if both profiles describe the same pixel grid.
    #[must_use]
    pub fn same_grid(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height && self.crs == other.crs
    }
}

/// Pixel data plus profile, held in memory.
///
/// Bands are stored row-major as `f64`; `profile.dtype` governs how they are
/// written back to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    profile: RasterProfile,
    bands: Vec<Vec<f64>>,
}

impl Raster {
    /// Creates a raster, checking that the band data matches the profile.
    pub fn new(profile: RasterProfile, bands: Vec<Vec<f64>>) -> Result<Self, RasterIoError> {
        if bands.len() != profile.count {
            return Err(RasterIoError::new(
                "<memory>",
                format!("profile declares {} bands, got {}", profile.count, bands.len()),
            ));
        }
        if let Some((idx, band)) = bands
            .iter()
            .enumerate()
            .find(|(_, band)| band.len() != profile.pixel_count())
        {
            return Err(RasterIoError::new(
                "<memory>",
                format!(
                    "band {} has {} pixels, expected {}",
                    idx + 1,
                    band.len(),
                    profile.pixel_count()
                ),
            ));
        }
        Ok(Self { profile, bands })
    }

    /// Creates a raster filled with `value`.
    #[must_use]
    pub fn filled(profile: RasterProfile, value: f64) -> Self {
        let bands = vec![vec![value; profile.pixel_count()]; profile.count];
        Self { profile, bands }
    }

    /// Returns the profile.
    #[must_use]
    pub fn profile(&self) -> &RasterProfile {
        &self.profile
    }

    /// Returns the band at a 1-based index.
    #[must_use]
    pub fn band(&self, index: usize) -> Option<&[f64]> {
        index.checked_sub(1).and_then(|i| self.bands.get(i)).map(Vec::as_slice)
    }

    /// Returns all bands in order.
    #[must_use]
    pub fn bands(&self) -> &[Vec<f64>] {
        &self.bands
    }

    /// Replaces the band at a 1-based index.
    pub fn write_band(&mut self, index: usize, data: Vec<f64>) -> Result<(), RasterIoError> {
        if data.len() != self.profile.pixel_count() {
            return Err(RasterIoError::new(
                "<memory>",
                format!("band {index} has {} pixels, expected {}", data.len(), self.profile.pixel_count()),
            ));
        }
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.bands.get_mut(i))
            .ok_or_else(|| RasterIoError::new("<memory>", format!("band index {index} out of range")))?;
        *slot = data;
        Ok(())
    }

    /// Consumes the raster, returning its parts.
    #[must_use]
    pub fn into_parts(self) -> (RasterProfile, Vec<Vec<f64>>) {
        (self.profile, self.bands)
    }
}

/// A raster backed by a file or by memory.
#[derive(Debug, Clone)]
pub enum RasterSource {
    /// A GeoTIFF on disk.
    File(PathBuf),
    /// A raster held in memory.
    Memory(Arc<Raster>),
}

impl RasterSource {
    /// Creates a file-backed source.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Creates a memory-backed source.
    #[must_use]
    pub fn memory(raster: Raster) -> Self {
        Self::Memory(Arc::new(raster))
    }

    /// Returns the file path for file-backed sources.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory(_) => None,
        }
    }

    /// Loads the raster, reading it through `driver` if it lives on disk.
    pub fn load(&self, driver: &dyn RasterDriver) -> Result<Arc<Raster>, RasterIoError> {
        match self {
            Self::File(path) => driver.read(path).map(Arc::new),
            Self::Memory(raster) => Ok(Arc::clone(raster)),
        }
    }

    /// Human-readable description used in logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory(raster) => format!("<memory {}>", raster.profile().grid_summary()),
        }
    }
}
