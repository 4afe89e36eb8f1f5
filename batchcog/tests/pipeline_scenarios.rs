//! End-to-end pipeline runs against fake encoders and stores.

use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batchcog::cancellation::CancellationToken;
use batchcog::config::{PipelineConfig, ProfileOverrides};
use batchcog::errors::{BatchCogError, EncodingError};
use batchcog::events::{kinds, CollectingEventSink};
use batchcog::pipeline::{CogPipeline, PipelineRequest, PipelineState};
use batchcog::raster::{Crs, DataType, GeoTiffDriver, Raster, RasterDriver, RasterProfile};
use batchcog::stages::{CogCodec, CogEncoder, EncodingProfile, UploadTarget};
use batchcog::testing::{gradient, single_band_raster, write_raster, FailingEncoder, PassthroughEncoder, RecordingBlobStore};

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<RecordingBlobStore>,
    events: Arc<CollectingEventSink>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(RecordingBlobStore::new()),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig::default().with_scratch_root(self.scratch())
    }

    fn pipeline(&self, encoder: Arc<dyn CogEncoder>) -> CogPipeline {
        self.pipeline_with(self.config(), encoder)
    }

    fn pipeline_with(&self, config: PipelineConfig, encoder: Arc<dyn CogEncoder>) -> CogPipeline {
        CogPipeline::builder(config)
            .encoder(encoder)
            .blob_store(self.store.clone())
            .event_sink(self.events.clone())
            .build()
            .unwrap()
    }

    fn input(&self, name: &str, raster: &Raster) -> String {
        let path = self.dir.path().join(name);
        write_raster(&path, raster).unwrap();
        path.to_string_lossy().to_string()
    }

    fn wgs84_band(&self, name: &str, max: f64) -> String {
        self.input(name, &single_band_raster(100, 100, Crs::WGS84, gradient(100, 100, max)))
    }

    fn uploaded(&self, target: &UploadTarget) -> Raster {
        let bytes = self.store.object(target).expect("object was uploaded");
        GeoTiffDriver::new().decode(bytes, Path::new("uploaded.tif")).unwrap()
    }

    /// Asserts the scratch root holds no workspaces.
    fn assert_scratch_empty(&self) {
        let scratch = self.scratch();
        if scratch.exists() {
            let left: Vec<_> = std::fs::read_dir(&scratch).unwrap().collect();
            assert!(left.is_empty(), "workspace left behind: {left:?}");
        }
    }
}

#[tokio::test]
async fn test_single_band_run_reprojects_to_web_mercator() {
    let h = Harness::new();
    let input = h.wgs84_band("dem.tif", 3000.0);
    let target = UploadTarget::new("cogs", "dem/3857.tif");
    let encoder = Arc::new(PassthroughEncoder::default());

    let report = h
        .pipeline(encoder.clone())
        .run(PipelineRequest::single_band(input, target.clone()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.states,
        vec![
            PipelineState::Start,
            PipelineState::Reprojected,
            PipelineState::Encoded,
            PipelineState::Uploaded,
            PipelineState::Done,
        ]
    );
    assert_eq!(report.bands, 1);
    assert_eq!(report.sha256.len(), 64);

    let cog = h.uploaded(&target);
    assert_eq!(cog.profile().crs, Some(Crs::WEB_MERCATOR));
    assert_eq!(cog.profile().dtype, DataType::U16);
    assert_eq!(cog.profile().nodata, Some(0.0));
    assert_eq!(cog.profile().count, 1);
    assert_eq!(report.bytes, h.store.object(&target).unwrap().len() as u64);

    let calls = encoder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].2, EncodingProfile::single_band());
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_three_band_run_composites_and_masks() {
    let h = Harness::new();
    let red = h.wgs84_band("b4.tif", 4000.0);
    let green = h.wgs84_band("b3.tif", 2500.0);
    let blue = h.wgs84_band("b2.tif", 1000.0);
    let target = UploadTarget::new("cogs", "scene/rgb.tif");
    let encoder = Arc::new(PassthroughEncoder::default());

    let report = h
        .pipeline(encoder.clone())
        .run(PipelineRequest::rgb(red, green, blue, target.clone()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.states[1], PipelineState::Composited);
    assert_eq!(report.states.last(), Some(&PipelineState::Done));

    let cog = h.uploaded(&target);
    let profile = cog.profile();
    assert_eq!(profile.crs, Some(Crs::WEB_MERCATOR));
    assert_eq!(profile.dtype, DataType::U8);
    // Three stretched bands plus the alpha mask.
    assert_eq!(profile.count, 4);
    assert!(cog.bands().iter().flatten().all(|v| (0.0..=255.0).contains(v)));
    assert!(cog.band(4).unwrap().contains(&255.0));
    assert!(cog.band(1).unwrap().iter().any(|v| *v >= 240.0));

    assert_eq!(encoder.calls()[0].2, EncodingProfile::rgb());
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_state_changes_are_emitted_in_order() {
    let h = Harness::new();
    let input = h.wgs84_band("a.tif", 100.0);

    h.pipeline(Arc::new(PassthroughEncoder::default()))
        .run(
            PipelineRequest::single_band(input, UploadTarget::new("cogs", "a.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(h.events.states(), vec!["reprojected", "encoded", "uploaded", "done"]);
    assert_eq!(h.events.payloads_of(kinds::STAGE_COMPLETED).len(), 3);
    assert_eq!(h.events.payloads_of(kinds::RUN_COMPLETED).len(), 1);
    let released = h.events.payloads_of(kinds::WORKSPACE_RELEASED);
    assert_eq!(released[0]["released"], true);
}

#[tokio::test]
async fn test_encoder_failure_skips_upload_and_cleans_up() {
    let h = Harness::new();
    let input = h.wgs84_band("a.tif", 100.0);

    let err = h
        .pipeline(Arc::new(FailingEncoder::new(2, "GDAL error")))
        .run(
            PipelineRequest::single_band(input, UploadTarget::new("cogs", "a.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        BatchCogError::Encoding(e) => assert_eq!(e.exit_code, Some(2)),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.store.puts().is_empty());
    assert_eq!(h.events.states(), vec!["reprojected", "failed"]);
    assert_eq!(h.events.payloads_of(kinds::RUN_FAILED)[0]["kind"], "encoding");
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_degenerate_band_fails_before_reprojection() {
    let h = Harness::new();
    let good = h.wgs84_band("good.tif", 100.0);
    let flat = h.input("flat.tif", &single_band_raster(100, 100, Crs::WGS84, vec![0.0; 10_000]));
    let encoder = Arc::new(PassthroughEncoder::default());

    let err = h
        .pipeline(encoder.clone())
        .run(
            PipelineRequest::rgb(good.clone(), flat, good, UploadTarget::new("cogs", "x.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        BatchCogError::DegenerateBand(e) => assert_eq!(e.band_index, 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(encoder.calls().is_empty());
    assert_eq!(h.events.states(), vec!["failed"]);
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_mismatched_bands_are_rejected() {
    let h = Harness::new();
    let big = h.wgs84_band("big.tif", 100.0);
    let small = h.input("small.tif", &single_band_raster(50, 100, Crs::WGS84, gradient(50, 100, 10.0)));

    let err = h
        .pipeline(Arc::new(PassthroughEncoder::default()))
        .run(
            PipelineRequest::new([big.clone(), big, small], UploadTarget::new("cogs", "x.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BatchCogError::ShapeMismatch(_)));
    assert!(h.store.is_empty());
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_missing_crs_is_reprojection_error() {
    let h = Harness::new();
    let profile = RasterProfile {
        crs: None,
        ..single_band_raster(10, 10, Crs::WGS84, gradient(10, 10, 5.0)).profile().clone()
    };
    let input = h.input("nocrs.tif", &Raster::new(profile, vec![gradient(10, 10, 5.0)]).unwrap());

    let err = h
        .pipeline(Arc::new(PassthroughEncoder::default()))
        .run(
            PipelineRequest::single_band(input, UploadTarget::new("cogs", "x.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BatchCogError::Reprojection(_)));
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_upload_failure_is_reported_and_cleaned_up() {
    let h = Harness::new();
    let input = h.wgs84_band("a.tif", 100.0);
    h.store.fail_puts("access denied");

    let err = h
        .pipeline(Arc::new(PassthroughEncoder::default()))
        .run(
            PipelineRequest::single_band(input, UploadTarget::new("cogs", "a.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        BatchCogError::Upload(e) => {
            assert_eq!(e.bucket, "cogs");
            assert_eq!(e.message, "access denied");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.events.states(), vec!["reprojected", "encoded", "failed"]);
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_missing_input_is_input_error() {
    let h = Harness::new();
    let missing = h.dir.path().join("nope.tif").to_string_lossy().to_string();

    let err = h
        .pipeline(Arc::new(PassthroughEncoder::default()))
        .run(
            PipelineRequest::single_band(missing, UploadTarget::new("cogs", "a.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BatchCogError::Input(_)));
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_cancelled_before_start_does_nothing() {
    let h = Harness::new();
    let input = h.wgs84_band("a.tif", 100.0);
    let encoder = Arc::new(PassthroughEncoder::default());
    let token = CancellationToken::new();
    token.cancel("shutdown");

    let err = h
        .pipeline(encoder.clone())
        .run(PipelineRequest::single_band(input, UploadTarget::new("cogs", "a.tif")), &token)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(encoder.calls().is_empty());
    assert!(h.store.puts().is_empty());
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_cancel_during_encode_stops_before_upload() {
    let h = Harness::new();
    let input = h.wgs84_band("a.tif", 100.0);
    let token = Arc::new(CancellationToken::new());
    let from_encoder = token.clone();
    let encoder = PassthroughEncoder::default().with_hook(move || from_encoder.cancel("ctrl-c"));

    let err = h
        .pipeline(Arc::new(encoder))
        .run(PipelineRequest::single_band(input, UploadTarget::new("cogs", "a.tif")), &token)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(err.to_string().contains("before upload"));
    assert!(h.store.puts().is_empty());
    assert_eq!(h.events.states(), vec!["reprojected", "encoded", "failed"]);
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_blob_inputs_are_downloaded() {
    let h = Harness::new();
    let raster = single_band_raster(40, 40, Crs::WGS84, gradient(40, 40, 900.0));
    let bytes = GeoTiffDriver::new().encode(&raster, Path::new("seed.tif")).unwrap();
    h.store.insert(UploadTarget::new("raw", "tiles/seed.tif"), bytes);
    let target = UploadTarget::new("cogs", "seed.tif");

    h.pipeline(Arc::new(PassthroughEncoder::default()))
        .run(
            PipelineRequest::single_band("s3://raw/tiles/seed.tif", target.clone()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(h.uploaded(&target).profile().crs, Some(Crs::WEB_MERCATOR));
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_configured_codec_and_crs_are_used() {
    let h = Harness::new();
    let input = h.input(
        "merc.tif",
        &single_band_raster(20, 20, Crs::WEB_MERCATOR, gradient(20, 20, 50.0)),
    );
    let mut config = h.config().with_target_crs(Crs::WGS84);
    config.profiles = ProfileOverrides {
        single_band_codec: Some(CogCodec::Zstd),
        multi_band_codec: None,
    };
    let encoder = Arc::new(PassthroughEncoder::default());
    let target = UploadTarget::new("cogs", "geo.tif");

    h.pipeline_with(config, encoder.clone())
        .run(PipelineRequest::single_band(input, target.clone()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(encoder.calls()[0].2.codec, CogCodec::Zstd);
    assert_eq!(h.uploaded(&target).profile().crs, Some(Crs::WGS84));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_runs_stay_isolated() {
    let h = Harness::new();
    let input = h.input("shared.tif", &single_band_raster(32, 32, Crs::WGS84, gradient(32, 32, 500.0)));
    let encoder = Arc::new(PassthroughEncoder::default());
    let pipeline = Arc::new(h.pipeline(encoder.clone()));

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            let input = input.clone();
            tokio::spawn(async move {
                let target = UploadTarget::new("cogs", format!("runs/{i}.tif"));
                pipeline
                    .run(PipelineRequest::single_band(input, target), &CancellationToken::new())
                    .await
            })
        })
        .collect();

    let mut run_ids = HashSet::new();
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert!(run_ids.insert(report.run_id));
    }

    assert_eq!(h.store.len(), 50);
    let calls = encoder.calls();
    let artifacts: HashSet<&PathBuf> = calls.iter().flat_map(|(src, dst, _)| [src, dst]).collect();
    assert_eq!(artifacts.len(), 100);
    let workspaces: HashSet<&Path> = calls.iter().filter_map(|(src, _, _)| src.parent()).collect();
    assert_eq!(workspaces.len(), 50);
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_empty_request_is_rejected_without_workspace() {
    let h = Harness::new();
    let err = h
        .pipeline(Arc::new(PassthroughEncoder::default()))
        .run(
            PipelineRequest::new(Vec::<String>::new(), UploadTarget::new("cogs", "a.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BatchCogError::Config(_)));
    assert!(!h.scratch().exists());
}

/// Encoder that deletes the run's workspace out from under the pipeline, then
/// fails. Removing the workspace afterwards can only fail.
#[derive(Debug)]
struct WorkspaceVanishingEncoder;

#[async_trait::async_trait]
impl CogEncoder for WorkspaceVanishingEncoder {
    async fn encode(&self, _src: &Path, dst: &Path, _profile: &EncodingProfile) -> Result<(), EncodingError> {
        let workspace = dst.parent().expect("artifact lives in the workspace");
        std::fs::remove_dir_all(workspace).unwrap();
        Err(EncodingError::new("converter crashed").with_exit_code(Some(139)))
    }
}

#[tokio::test]
async fn test_cleanup_failure_does_not_mask_stage_error() {
    let h = Harness::new();
    let input = h.wgs84_band("a.tif", 100.0);

    let err = h
        .pipeline(Arc::new(WorkspaceVanishingEncoder))
        .run(
            PipelineRequest::single_band(input, UploadTarget::new("cogs", "a.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        BatchCogError::Encoding(e) => assert_eq!(e.exit_code, Some(139)),
        other => panic!("cleanup error replaced the stage error: {other}"),
    }
    let released = h.events.payloads_of(kinds::WORKSPACE_RELEASED);
    assert_eq!(released.len(), 1);
    assert_eq!(released[0]["released"], false);
    assert_eq!(h.events.payloads_of(kinds::RUN_FAILED)[0]["kind"], "encoding");
    assert_eq!(h.events.states(), vec!["reprojected", "failed"]);
    assert!(h.store.puts().is_empty());
    h.assert_scratch_empty();
}

#[tokio::test]
async fn test_unusable_scratch_root_is_workspace_error() {
    let h = Harness::new();
    let input = h.wgs84_band("a.tif", 100.0);
    // A regular file where the scratch root should be.
    let blocker = h.dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let encoder = Arc::new(PassthroughEncoder::default());

    let err = h
        .pipeline_with(PipelineConfig::default().with_scratch_root(blocker.clone()), encoder.clone())
        .run(
            PipelineRequest::single_band(input, UploadTarget::new("cogs", "a.tif")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        BatchCogError::Workspace(e) => assert_eq!(e.path, blocker),
        other => panic!("unexpected error: {other}"),
    }
    assert!(encoder.calls().is_empty());
    assert!(h.events.is_empty());
    assert!(h.store.is_empty());
    assert!(blocker.is_file());
}

#[test]
fn test_driver_is_object_safe() {
    let driver: Arc<dyn RasterDriver> = Arc::new(GeoTiffDriver::new());
    assert!(format!("{driver:?}").contains("GeoTiffDriver"));
}
