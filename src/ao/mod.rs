//! Analysis Orchestrator (AO) — spec.md §4.5.
//!
//! A deterministic state machine with durable checkpoints. Every
//! state-transition writes `(run_id, state, input)` to the Shared State
//! Store before proceeding, so a crashed replica's in-progress runs can be
//! rediscovered and re-entered on startup (see [`AnalysisOrchestrator::resume_in_progress_runs`]).

use crate::config;
use crate::consolidator::{ConsolidatorError, ImageResult, ResultsConsolidator};
use crate::error::{ErrorKind, KindedError};
use crate::mlm::{MlmError, ModelLifecycleManager};
use crate::objstore::{keys, ObjectStore, ObjectStoreError};
use crate::sss::{SharedStateStore, SssError};
use crate::types::{AnalysisRun, Region, RunStatus};
use crate::workers::{
    ClusterTrainerRequest, SearchImagesRequest, VegetationAnalyzerRequest, VisualizationRequest,
    Workers, WorkerError,
};
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AoError {
    #[error("shared state store error: {0}")]
    Sss(#[from] SssError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("model lifecycle error: {0}")]
    Mlm(#[from] MlmError),
    #[error("consolidation error: {0}")]
    Consolidator(#[from] ConsolidatorError),
    #[error("run {0} timed out")]
    TimedOut(String),
    #[error("run {0} not found")]
    RunNotFound(String),
}

impl KindedError for AoError {
    fn kind(&self) -> ErrorKind {
        match self {
            AoError::Sss(e) => e.kind(),
            AoError::ObjectStore(e) => e.kind(),
            AoError::Worker(e) => e.kind(),
            AoError::Mlm(e) => e.kind(),
            AoError::Consolidator(e) => e.kind(),
            AoError::TimedOut(_) => ErrorKind::Transient,
            AoError::RunNotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// One completed (or failed) per-image branch of `MapPerImage`.
struct PerImageResult {
    image_result: ImageResult,
    chart_refs: Vec<String>,
}

pub struct AnalysisOrchestrator {
    sss: SharedStateStore,
    os: ObjectStore,
    workers: Arc<dyn Workers>,
    mlm: ModelLifecycleManager,
    consolidator: ResultsConsolidator,
}

impl AnalysisOrchestrator {
    pub fn new(sss: SharedStateStore, os: ObjectStore, workers: Arc<dyn Workers>) -> Self {
        let mlm = ModelLifecycleManager::new(sss.clone(), os.clone(), workers.clone());
        let consolidator = ResultsConsolidator::new(sss.clone(), os.clone(), workers.clone());
        Self { sss, os, workers, mlm, consolidator }
    }

    /// Retry an I/O-bound task per the declared [`RetryPolicy`] (spec §4.5):
    /// `Transient`/`Conflict` errors are retried with exponential backoff and
    /// jitter; everything else propagates on first failure.
    async fn with_retry<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: KindedError,
    {
        let policy = config::get().orchestrator.retry;
        let mut attempt = 0u32;
        let mut backoff_ms = policy.initial_backoff_ms as f64;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.kind().is_retriable() && attempt + 1 < policy.max_attempts => {
                    attempt += 1;
                    let jitter = backoff_ms * policy.jitter_fraction * (rand::random::<f64>() * 2.0 - 1.0);
                    let sleep_ms = (backoff_ms + jitter).max(0.0) as u64;
                    tracing::warn!(attempt, sleep_ms, "retrying after backoff");
                    tokio::time::sleep(tokio::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms *= policy.multiplier;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist a mid-run checkpoint: `(run_id, state=S, input=X)` per spec
    /// §4.5's durability contract. Inputs exceeding
    /// `max_transition_payload_bytes` are offloaded to the Object Store and
    /// replaced with a handle, since only references (not pixel-scale
    /// payloads) may cross a state transition.
    async fn checkpoint(&self, run: &mut AnalysisRun, state: &str, input: serde_json::Value) -> Result<(), AoError> {
        let max_bytes = config::get().orchestrator.max_transition_payload_bytes;
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        let stored_input = if bytes.len() > max_bytes {
            let key = format!("transition-payloads/{}/{state}.json", run.run_id);
            self.os.put(&key, &bytes).await?;
            serde_json::json!({ "os_ref": key })
        } else {
            input
        };

        run.current_state = state.to_string();
        run.state_input = stored_input;
        self.sss.put_analysis_run(run).await?;
        Ok(())
    }

    /// `trigger_analysis` — the entry point a scheduler firing or an
    /// immediate-analysis API call uses. Drives the run to a terminal state
    /// under the run-level timeout.
    pub async fn trigger_analysis(
        &self,
        region: &Region,
        start_date: &str,
        end_date: &str,
    ) -> Result<AnalysisRun, AoError> {
        let run_id = Uuid::new_v4().to_string();
        let mut run = AnalysisRun {
            run_id: run_id.clone(),
            region_id: region.region_id.clone(),
            status: RunStatus::InProgress,
            started_at: Utc::now(),
            ended_at: None,
            progress: 0,
            input: serde_json::json!({ "start_date": start_date, "end_date": end_date }),
            output: None,
            error: None,
            current_state: "SearchImages".to_string(),
            state_input: serde_json::json!({}),
        };
        self.sss.put_analysis_run(&run).await?;

        let timeout = tokio::time::Duration::from_secs(config::get().orchestrator.run_timeout_secs);
        match tokio::time::timeout(timeout, self.drive(&mut run, region, start_date, end_date)).await {
            Ok(Ok(())) => Ok(run),
            Ok(Err(e)) => {
                self.sss
                    .transition_run_status(&run_id, RunStatus::Failed, "Failed", Some(e.to_string()))
                    .await?;
                Err(e)
            }
            Err(_) => {
                self.sss
                    .transition_run_status(&run_id, RunStatus::TimedOut, "Failed", Some("run timeout exceeded".to_string()))
                    .await?;
                Err(AoError::TimedOut(run_id))
            }
        }
    }

    /// Re-enter the last recorded state for every run left `IN_PROGRESS` by a
    /// crashed replica (spec §4.5 durability/recovery contract). Crash
    /// recovery here re-drives the run from `SearchImages`, which is safe
    /// because every downstream task action is idempotent or guarded by a
    /// `(run_id, state)` dedup key (artifact keys embed `run_id`; alert
    /// writes are conditional on the dedup key, not the run).
    pub async fn resume_in_progress_runs(&self) -> Result<usize, AoError> {
        let stale = self.sss.query_runs_by_status(RunStatus::InProgress).await?;
        let mut resumed = 0;
        for mut run in stale {
            tracing::warn!(run_id = %run.run_id, state = %run.current_state, "resuming in-progress run after restart");
            let Some(region) = self.sss.get_region(&run.region_id).await? else {
                tracing::error!(run_id = %run.run_id, region_id = %run.region_id, "region vanished — failing orphaned run");
                self.sss
                    .transition_run_status(&run.run_id, RunStatus::Failed, "Failed", Some("region no longer exists".to_string()))
                    .await?;
                continue;
            };
            let start_date = run.input.get("start_date").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let end_date = run.input.get("end_date").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if let Err(e) = self.drive(&mut run, &region, &start_date, &end_date).await {
                tracing::error!(run_id = %run.run_id, error = %e, "resumed run failed");
                self.sss
                    .transition_run_status(&run.run_id, RunStatus::Failed, "Failed", Some(e.to_string()))
                    .await?;
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn drive(&self, run: &mut AnalysisRun, region: &Region, start_date: &str, end_date: &str) -> Result<(), AoError> {
        // SearchImages
        self.checkpoint(run, "SearchImages", serde_json::json!({"start_date": start_date, "end_date": end_date})).await?;
        let search_result = self
            .with_retry(|| {
                self.workers.search_images(SearchImagesRequest {
                    latitude: region.center.latitude,
                    longitude: region.center.longitude,
                    start_date: start_date.to_string(),
                    end_date: end_date.to_string(),
                    cloud_cover: region.cloud_cover_threshold,
                })
            })
            .await?;

        // CheckImagesFound
        self.checkpoint(run, "CheckImagesFound", serde_json::json!({"count": search_result.count})).await?;
        if search_result.count == 0 {
            self.sss
                .update_region(&run.region_id, |r| r.last_analysis_at = Some(Utc::now()))
                .await?;
            *run = self
                .sss
                .transition_run_status(&run.run_id, RunStatus::NoImagesFound, "NoImagesFound", None)
                .await?;
            return Ok(());
        }

        // MapPerImage: fan out up to MAX_PARALLEL_IMAGES concurrent per-image branches.
        self.checkpoint(run, "MapPerImage", serde_json::json!({"image_count": search_result.images.len()})).await?;
        let max_parallel = config::get().orchestrator.max_parallel_images;
        let region_id = run.region_id.clone();
        let run_id = run.run_id.clone();

        let outcomes: Vec<PerImageResult> = stream::iter(search_result.images)
            .map(|image| {
                let region_id = region_id.clone();
                let run_id = run_id.clone();
                async move { self.run_per_image(&region_id, &run_id, image).await }
            })
            .buffer_unordered(max_parallel)
            .collect()
            .await;

        // ConsolidateResults
        self.checkpoint(run, "ConsolidateResults", serde_json::json!({"branches": outcomes.len()})).await?;
        let image_results: Vec<ImageResult> = outcomes.iter().map(|o| o.image_result.clone()).collect();

        if !image_results.iter().any(|r| r.success) {
            *run = self
                .sss
                .transition_run_status(&run.run_id, RunStatus::Failed, "Failed", Some("all per-image branches failed".to_string()))
                .await?;
            return Ok(());
        }

        let outcome = self.consolidator.consolidate(&region_id, &region.name, &image_results).await?;

        self.sss
            .update_region(&region_id, |r| {
                r.last_analysis_at = Some(Utc::now());
                r.last_deforestation_percentage = Some(outcome.deforestation_percentage);
            })
            .await?;

        // SendAlert (notification already emitted inside the consolidator) -> Done.
        self.checkpoint(run, "SendAlert", serde_json::json!({"alert_emitted": outcome.alert.is_some()})).await?;
        let chart_refs: Vec<&str> = outcomes.iter().flat_map(|o| o.chart_refs.iter().map(String::as_str)).collect();
        run.output = Some(serde_json::json!({
            "risk_level": outcome.risk_level.to_string(),
            "deforestation_percentage": outcome.deforestation_percentage,
            "confidence_score": outcome.confidence_score,
            "alert_id": outcome.alert.as_ref().map(|a| a.alert_id.clone()),
            "chart_refs": chart_refs,
        }));
        self.sss.put_analysis_run(run).await?;
        *run = self
            .sss
            .transition_run_status(&run.run_id, RunStatus::Succeeded, "Done", None)
            .await?;
        Ok(())
    }

    /// Drives one image through `PerImage.NDVI` .. `PerImage.GenerateVisualizations`.
    /// Failure in any step ends this branch in `PerImage.Failed` without
    /// propagating to the parent run (spec §4.5 per-image concurrency rule).
    async fn run_per_image(&self, region_id: &str, run_id: &str, image: crate::workers::SatelliteImage) -> PerImageResult {
        let start = std::time::Instant::now();
        let tile_id = region_id.to_string();
        let region_tag = region_id.to_string();
        // Ordering for cluster-shift detection must follow the image's actual
        // capture date, not wall-clock completion time — concurrent per-image
        // branches finish in unpredictable order.
        let captured_at = capture_timestamp(&image.date);

        let ndvi = self
            .with_retry(|| {
                self.workers.vegetation_analyzer(VegetationAnalyzerRequest {
                    image_id: image.id.clone(),
                    red_url: image.assets.red_url.clone(),
                    nir_url: image.assets.nir_url.clone(),
                    output_bucket: keys::geospatial_data(captured_at.year(), captured_at.month(), captured_at.day(), run_id),
                    region: region_id.to_string(),
                })
            })
            .await;

        let ndvi = match ndvi {
            Ok(r) if r.success => r,
            _ => {
                return PerImageResult {
                    image_result: ImageResult {
                        image_id: image.id,
                        success: false,
                        timestamp: captured_at,
                        statistics: None,
                        cluster_ndvi_centroids: None,
                        cluster_sizes: None,
                        model_used: None,
                        processing_time_ms: start.elapsed().as_millis() as u64,
                        tile_id,
                    },
                    chart_refs: Vec::new(),
                };
            }
        };

        // CheckExistingModel / DecideModelStrategy
        let existing = self.mlm.get_latest_model(&tile_id, &region_tag).await.ok().flatten();

        let (model_ref, model_version, cluster_ndvi_centroids, cluster_sizes) = if let Some(model) = existing {
            // UseExistingModel: no training job, reuse the prior artifact.
            // The worker contract has no "apply model to new data" call —
            // only cluster_trainer produces centroids/sizes, and it always
            // trains fresh — so a reused-model image carries no cluster
            // assignment of its own and consolidate()'s cluster-shift
            // detection skips it (it only compares consecutive images that
            // both have centroids).
            (model.artifact_ref, model.version, None, None)
        } else {
            let (elbow, _warning) = self.mlm.select_optimal_k(&ndvi.training_data_ref).await;
            let trained = self
                .with_retry(|| {
                    self.workers.cluster_trainer(ClusterTrainerRequest {
                        training_data_ref: ndvi.training_data_ref.clone(),
                        k: elbow.optimal_k,
                        feature_dim: crate::config::defaults::FEATURE_DIM,
                    })
                })
                .await;

            match trained {
                Ok(resp) => {
                    let saved = self
                        .mlm
                        .save_new_model(&tile_id, &region_tag, resp.model_artifact_ref.as_bytes(), run_id, elbow.optimal_k)
                        .await;
                    match saved {
                        Ok(model) => {
                            let ndvi_centroids: Vec<f64> = resp.cluster_centroids.iter().map(|c| c.first().copied().unwrap_or(0.0)).collect();
                            (model.artifact_ref, model.version, Some(ndvi_centroids), Some(resp.cluster_sizes))
                        }
                        Err(_) => {
                            return PerImageResult {
                                image_result: ImageResult {
                                    image_id: image.id,
                                    success: false,
                                    timestamp: captured_at,
                                    statistics: Some(ndvi.statistics),
                                    cluster_ndvi_centroids: None,
                                    cluster_sizes: None,
                                    model_used: None,
                                    processing_time_ms: start.elapsed().as_millis() as u64,
                                    tile_id,
                                },
                                chart_refs: Vec::new(),
                            };
                        }
                    }
                }
                Err(_) => {
                    return PerImageResult {
                        image_result: ImageResult {
                            image_id: image.id,
                            success: false,
                            timestamp: captured_at,
                            statistics: Some(ndvi.statistics),
                            cluster_ndvi_centroids: None,
                            cluster_sizes: None,
                            model_used: None,
                            processing_time_ms: start.elapsed().as_millis() as u64,
                            tile_id,
                        },
                        chart_refs: Vec::new(),
                    };
                }
            }
        };

        // GenerateVisualizations
        let chart_refs = self
            .workers
            .visualization_generator(VisualizationRequest {
                model_artifact_ref: model_ref,
                training_data_ref: ndvi.training_data_ref.clone(),
                tile_id: tile_id.clone(),
                region_id: region_id.to_string(),
                timestamp: Utc::now().timestamp(),
            })
            .await
            .map(|r| r.chart_refs)
            .unwrap_or_default();

        PerImageResult {
            image_result: ImageResult {
                image_id: image.id,
                success: true,
                timestamp: captured_at,
                statistics: Some(ndvi.statistics),
                cluster_ndvi_centroids,
                cluster_sizes,
                model_used: Some(model_version),
                processing_time_ms: start.elapsed().as_millis() as u64,
                tile_id,
            },
            chart_refs,
        }
    }
}

/// Parse a satellite image's `YYYY-MM-DD` capture date into midnight UTC.
/// Falls back to the current time on malformed input rather than failing
/// the whole branch over a date-formatting worker bug.
fn capture_timestamp(date: &str) -> chrono::DateTime<Utc> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|dt| Utc.from_local_datetime(&dt).single())
        .unwrap_or_else(Utc::now)
}
