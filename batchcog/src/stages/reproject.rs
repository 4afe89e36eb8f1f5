//! Reprojection stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::errors::{ReprojectionError, Result};
use crate::georef::{GeoreferencingEngine, GridMut, GridRef, Resampling};
use crate::raster::{Crs, Raster, RasterDriver, RasterSource};

/// Nodata value of every reprojected raster.
pub const REPROJECTED_NODATA: f64 = 0.0;

/// Warps rasters into a target CRS and writes them to disk.
#[derive(Debug, Clone)]
pub struct Reprojector {
    engine: Arc<dyn GeoreferencingEngine>,
    driver: Arc<dyn RasterDriver>,
}

impl Reprojector {
    /// Creates a reprojector.
    #[must_use]
    pub fn new(engine: Arc<dyn GeoreferencingEngine>, driver: Arc<dyn RasterDriver>) -> Self {
        Self { engine, driver }
    }

    /// Reprojects `source` into `target_crs`, writing the result to `dest`.
    ///
    /// Runs on the blocking pool.
    pub async fn reproject(&self, source: RasterSource, target_crs: Crs, dest: PathBuf) -> Result<RasterSource> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.reproject_blocking(&source, target_crs, &dest)).await?
    }

    /// Synchronous body of [`Reprojector::reproject`].
    ///
    /// The output copies the source profile with a new CRS, transform and
    /// size, and nodata set to 0. Pixels that are nodata in the source or
    /// fall outside it become 0.
    pub fn reproject_blocking(&self, source: &RasterSource, target_crs: Crs, dest: &Path) -> Result<RasterSource> {
        let raster = source.load(self.driver.as_ref())?;
        let src = raster.profile();
        let src_crs = src.crs.ok_or_else(ReprojectionError::missing_crs)?;

        let geometry =
            self.engine
                .compute_target_geometry(src_crs, target_crs, src.width, src.height, &src.bounds())?;

        let mut profile = src.clone();
        profile.crs = Some(target_crs);
        profile.transform = geometry.transform;
        profile.width = geometry.width;
        profile.height = geometry.height;
        profile.nodata = Some(REPROJECTED_NODATA);

        let mut bands = Vec::with_capacity(src.count);
        for band in raster.bands() {
            let mut out = vec![REPROJECTED_NODATA; profile.pixel_count()];
            self.engine.resample_band(
                GridRef {
                    data: band,
                    width: src.width,
                    height: src.height,
                    transform: &src.transform,
                    crs: src_crs,
                    nodata: src.nodata,
                },
                GridMut {
                    data: &mut out,
                    width: profile.width,
                    height: profile.height,
                    transform: &profile.transform,
                    crs: target_crs,
                    fill: REPROJECTED_NODATA,
                },
                Resampling::Nearest,
            )?;
            bands.push(out);
        }

        debug!(
            source = %source.describe(),
            from = %src_crs,
            to = %target_crs,
            grid = %profile.grid_summary(),
            "raster reprojected"
        );

        let output = Raster::new(profile, bands)?;
        self.driver.write(dest, &output)?;
        Ok(RasterSource::file(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BatchCogError;
    use crate::georef::{ProjEngine, TargetGeometry};
    use crate::raster::{Bounds, DataType, GeoTiffDriver, GeoTransform, RasterProfile};
    use pretty_assertions::assert_eq;

    fn reprojector() -> Reprojector {
        Reprojector::new(Arc::new(ProjEngine::new()), Arc::new(GeoTiffDriver::new()))
    }

    fn wgs84_tile(crs: Option<Crs>, nodata: Option<f64>) -> Raster {
        let profile = RasterProfile {
            crs,
            transform: GeoTransform::north_up(-122.5, 37.8, 0.001, 0.001),
            width: 100,
            height: 100,
            count: 1,
            dtype: DataType::U16,
            nodata,
        };
        let data = (0..10_000).map(|i| f64::from(i % 1000 + 1)).collect();
        Raster::new(profile, vec![data]).unwrap()
    }

    #[tokio::test]
    async fn test_reproject_to_web_mercator() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tif");
        let source = RasterSource::memory(wgs84_tile(Some(Crs::WGS84), None));

        let out = reprojector()
            .reproject(source, Crs::WEB_MERCATOR, dest.clone())
            .await
            .unwrap();

        assert_eq!(out.path(), Some(dest.as_path()));
        let raster = GeoTiffDriver::new().read(&dest).unwrap();
        let profile = raster.profile();
        assert_eq!(profile.crs, Some(Crs::WEB_MERCATOR));
        assert_eq!(profile.dtype, DataType::U16);
        assert_eq!(profile.nodata, Some(0.0));
        assert_eq!(profile.count, 1);
        assert!(profile.transform.origin_x < -13_630_000.0);
        assert!(raster.band(1).unwrap().iter().any(|v| *v > 0.0));
    }

    #[tokio::test]
    async fn test_reproject_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.tif");
        let dest = dir.path().join("out.tif");
        GeoTiffDriver::new()
            .write(&input, &wgs84_tile(Some(Crs::WGS84), Some(65535.0)))
            .unwrap();

        reprojector()
            .reproject(RasterSource::file(&input), Crs::WEB_MERCATOR, dest.clone())
            .await
            .unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_missing_crs_is_reprojection_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tif");
        let source = RasterSource::memory(wgs84_tile(None, None));

        let err = reprojector()
            .reproject(source, Crs::WEB_MERCATOR, dest.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchCogError::Reprojection(_)));
        assert!(!dest.exists());
    }

    #[derive(Debug)]
    struct HalfShift;

    impl GeoreferencingEngine for HalfShift {
        fn compute_target_geometry(
            &self,
            _src_crs: Crs,
            _dst_crs: Crs,
            width: usize,
            height: usize,
            bounds: &Bounds,
        ) -> std::result::Result<TargetGeometry, ReprojectionError> {
            // Same resolution, shifted half the raster to the right.
            let pw = bounds.width() / width as f64;
            let ph = bounds.height() / height as f64;
            Ok(TargetGeometry {
                transform: GeoTransform::north_up(bounds.min_x + bounds.width() / 2.0, bounds.max_y, pw, ph),
                width,
                height,
            })
        }

        fn resample_band(
            &self,
            src: GridRef<'_>,
            dst: GridMut<'_>,
            method: Resampling,
        ) -> std::result::Result<(), ReprojectionError> {
            ProjEngine::new().resample_band(src, dst, method)
        }
    }

    #[test]
    fn test_outside_and_nodata_pixels_become_zero() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tif");
        let profile = RasterProfile {
            crs: Some(Crs::WEB_MERCATOR),
            transform: GeoTransform::north_up(0.0, 2.0, 1.0, 1.0),
            width: 4,
            height: 2,
            count: 1,
            dtype: DataType::I16,
            nodata: Some(-1.0),
        };
        let source = Raster::new(profile, vec![vec![1.0, 2.0, -1.0, 4.0, 5.0, 6.0, 7.0, 8.0]]).unwrap();

        let reprojector = Reprojector::new(Arc::new(HalfShift), Arc::new(GeoTiffDriver::new()));
        reprojector
            .reproject_blocking(&RasterSource::memory(source), Crs::WEB_MERCATOR, &dest)
            .unwrap();

        let out = GeoTiffDriver::new().read(&dest).unwrap();
        assert_eq!(out.band(1).unwrap(), &[0.0, 4.0, 0.0, 0.0, 7.0, 8.0, 0.0, 0.0]);
    }
}
