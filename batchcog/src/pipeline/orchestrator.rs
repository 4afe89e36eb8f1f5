//! The COG pipeline orchestrator.

use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::{PipelineRequest, PipelineState, RunReport, StateMachine};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::{ConfigError, RasterIoError, Result};
use crate::events::{kinds, EventSink, NoOpEventSink};
use crate::georef::{GeoreferencingEngine, ProjEngine};
use crate::observability::SpanTimer;
use crate::raster::{GeoTiffDriver, RasterDriver, RasterSource};
use crate::stages::composite::composite;
use crate::stages::encode::{CogEncoder, EncodingProfile, RioCogeoEncoder};
use crate::stages::fetch::{InputFetcher, InputLocator};
use crate::stages::reproject::Reprojector;
use crate::stages::upload::{file_digest, BlobStore, ObjectStoreBlobStore};
use crate::workspace::{ScratchWorkspace, WorkspaceHandle};

/// Builder for [`CogPipeline`]. Every collaborator has a production default.
#[derive(Debug)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    driver: Option<Arc<dyn RasterDriver>>,
    engine: Option<Arc<dyn GeoreferencingEngine>>,
    encoder: Option<Arc<dyn CogEncoder>>,
    store: Option<Arc<dyn BlobStore>>,
    events: Option<Arc<dyn EventSink>>,
}

impl PipelineBuilder {
    /// Starts a builder from `config`.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            driver: None,
            engine: None,
            encoder: None,
            store: None,
            events: None,
        }
    }

    /// Uses `driver` for GeoTIFF I/O.
    #[must_use]
    pub fn raster_driver(mut self, driver: Arc<dyn RasterDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Uses `engine` for reprojection math.
    #[must_use]
    pub fn georeferencing_engine(mut self, engine: Arc<dyn GeoreferencingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Uses `encoder` instead of spawning the configured program.
    #[must_use]
    pub fn encoder(mut self, encoder: Arc<dyn CogEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Uses `store` instead of S3.
    #[must_use]
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sends pipeline events to `events`.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates the configuration and builds the pipeline.
    pub fn build(self) -> Result<CogPipeline> {
        self.config.validate()?;

        let driver = self.driver.unwrap_or_else(|| Arc::new(GeoTiffDriver::new()));
        let engine = self.engine.unwrap_or_else(|| Arc::new(ProjEngine::new()));
        let encoder = self
            .encoder
            .unwrap_or_else(|| Arc::new(RioCogeoEncoder::new(self.config.encoder.clone())));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(ObjectStoreBlobStore::s3(self.config.storage.clone())));
        let fetcher = InputFetcher::new(Arc::clone(&store), self.config.fetch_timeout())?;

        Ok(CogPipeline {
            workspace: ScratchWorkspace::new(self.config.scratch_root.clone()),
            reprojector: Reprojector::new(engine, Arc::clone(&driver)),
            driver,
            encoder,
            store,
            fetcher,
            events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
            config: self.config,
        })
    }
}

/// Reprojects, composites, encodes and uploads rasters.
///
/// Share one instance (behind an `Arc`) between concurrent runs; runs never
/// share workspaces or artifact paths.
#[derive(Debug)]
pub struct CogPipeline {
    config: PipelineConfig,
    workspace: ScratchWorkspace,
    driver: Arc<dyn RasterDriver>,
    reprojector: Reprojector,
    encoder: Arc<dyn CogEncoder>,
    store: Arc<dyn BlobStore>,
    fetcher: InputFetcher,
    events: Arc<dyn EventSink>,
}

struct Uploaded {
    bytes: u64,
    sha256: String,
}

impl CogPipeline {
    /// Starts a [`PipelineBuilder`].
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Encoding profile used when a request does not carry one.
    #[must_use]
    pub fn default_profile(&self, band_count: usize) -> EncodingProfile {
        let profile = EncodingProfile::for_band_count(band_count);
        let codec = if band_count <= 1 {
            self.config.profiles.single_band_codec
        } else {
            self.config.profiles.multi_band_codec
        };
        match codec {
            Some(codec) => profile.with_codec(codec),
            None => profile,
        }
    }

    /// Runs `request` to completion.
    ///
    /// The workspace is released before this returns, on success, failure
    /// and cancellation alike. Cleanup problems are logged and never replace
    /// the run's own error.
    pub async fn run(&self, request: PipelineRequest, cancel: &CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, bands = request.band_count(), target = %request.target);
        self.run_inner(run_id, request, cancel).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: PipelineRequest, cancel: &CancellationToken) -> Result<RunReport> {
        if request.inputs.is_empty() {
            return Err(ConfigError::new("a run needs at least one input").into());
        }

        let started = Instant::now();
        let started_at = Utc::now();
        let workspace = self.workspace.acquire()?;
        info!(workspace = %workspace.path().display(), "run started");
        self.events
            .emit(
                kinds::RUN_STARTED,
                Some(json!({
                    "run_id": run_id,
                    "bands": request.band_count(),
                    "target": request.target.to_string(),
                })),
            )
            .await;

        let mut machine = StateMachine::new();
        let mut outcome = self.execute(run_id, &request, &workspace, &mut machine, cancel).await;
        if outcome.is_ok() {
            outcome = self.advance(run_id, &mut machine, PipelineState::Done).await.and(outcome);
        }

        if let Err(e) = &outcome {
            if let Some(from) = machine.fail() {
                self.emit_transition(run_id, from, PipelineState::Failed).await;
            }
            error!(error = %e, kind = e.kind(), state = %from_state(&machine), "run failed");
        }

        let released = workspace.release_with_timeout(self.config.cleanup_timeout()).await;
        self.events
            .emit(kinds::WORKSPACE_RELEASED, Some(json!({"run_id": run_id, "released": released})))
            .await;

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(uploaded) => {
                let report = RunReport {
                    run_id,
                    states: machine.history().to_vec(),
                    target: request.target,
                    bands: request.inputs.len(),
                    bytes: uploaded.bytes,
                    sha256: uploaded.sha256,
                    started_at,
                    duration_ms,
                };
                info!(bytes = report.bytes, duration_ms, "run completed");
                self.events
                    .emit(
                        kinds::RUN_COMPLETED,
                        Some(json!({"run_id": run_id, "bytes": report.bytes, "duration_ms": duration_ms})),
                    )
                    .await;
                Ok(report)
            }
            Err(e) => {
                self.events
                    .emit(
                        kinds::RUN_FAILED,
                        Some(json!({"run_id": run_id, "kind": e.kind(), "error": e.to_string()})),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: &PipelineRequest,
        workspace: &WorkspaceHandle,
        machine: &mut StateMachine,
        cancel: &CancellationToken,
    ) -> Result<Uploaded> {
        cancel.check("input resolution")?;
        let mut sources = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            let locator = InputLocator::parse(input)?;
            sources.push(RasterSource::File(self.fetcher.resolve(&locator, workspace).await?));
        }

        let source = if sources.len() > 1 {
            cancel.check("composite")?;
            let timer = SpanTimer::start("composite");
            let driver = Arc::clone(&self.driver);
            let composited = tokio::task::spawn_blocking(move || composite(&sources, driver.as_ref())).await??;
            self.stage_completed(run_id, timer).await;
            self.advance(run_id, machine, PipelineState::Composited).await?;
            composited
        } else {
            sources
                .pop()
                .ok_or_else(|| ConfigError::new("a run needs at least one input"))?
        };

        cancel.check("reproject")?;
        let timer = SpanTimer::start("reproject");
        let reprojected: PathBuf = workspace.new_artifact_path("tif");
        self.reprojector
            .reproject(source, self.config.target_crs, reprojected.clone())
            .await?;
        self.stage_completed(run_id, timer).await;
        self.advance(run_id, machine, PipelineState::Reprojected).await?;

        cancel.check("encode")?;
        let timer = SpanTimer::start("encode");
        let cog = workspace.new_artifact_path("tif");
        let profile = request
            .profile
            .clone()
            .unwrap_or_else(|| self.default_profile(request.band_count()));
        self.encoder.encode(&reprojected, &cog, &profile).await?;
        self.stage_completed(run_id, timer).await;
        self.advance(run_id, machine, PipelineState::Encoded).await?;

        cancel.check("upload")?;
        let timer = SpanTimer::start("upload");
        let (_, sha256) = file_digest(&cog)
            .await
            .map_err(|e| RasterIoError::new(&cog, format!("cannot hash artifact: {e}")))?;
        let bytes = self.store.put_object(&cog, &request.target).await?;
        self.stage_completed(run_id, timer).await;
        self.advance(run_id, machine, PipelineState::Uploaded).await?;

        Ok(Uploaded { bytes, sha256 })
    }

    async fn advance(&self, run_id: Uuid, machine: &mut StateMachine, next: PipelineState) -> Result<()> {
        let from = machine.advance(next)?;
        self.emit_transition(run_id, from, next).await;
        Ok(())
    }

    async fn emit_transition(&self, run_id: Uuid, from: PipelineState, to: PipelineState) {
        tracing::debug!(%from, %to, "state changed");
        self.events
            .emit(
                kinds::STATE_CHANGED,
                Some(json!({"run_id": run_id, "from": from, "to": to})),
            )
            .await;
    }

    async fn stage_completed(&self, run_id: Uuid, timer: SpanTimer) {
        let stage = timer.name();
        let duration_ms = timer.finish();
        self.events
            .emit(
                kinds::STAGE_COMPLETED,
                Some(json!({"run_id": run_id, "stage": stage, "duration_ms": duration_ms})),
            )
            .await;
    }
}

/// State the run failed from: the last state before `Failed`.
fn from_state(machine: &StateMachine) -> PipelineState {
    let history = machine.history();
    history
        .iter()
        .rev()
        .copied()
        .find(|s| *s != PipelineState::Failed)
        .unwrap_or_default()
}
