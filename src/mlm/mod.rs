//! Model Lifecycle Manager (MLM) — spec.md §4.4.

pub mod elbow;
mod performance;

pub use elbow::{elbow_pick, ElbowResult, ElbowWarning, KCandidateResult};
pub use performance::{track_performance, PerTileLocks};

use crate::config;
use crate::error::{ErrorKind, KindedError};
use crate::objstore::{keys, ObjectStore, ObjectStoreError};
use crate::sss::{SharedStateStore, SssError};
use crate::types::{ModelMetadata, TileModel};
use crate::workers::{ClusterTrainerRequest, WorkerError, Workers};
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum MlmError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    #[error("shared state store error: {0}")]
    Sss(#[from] SssError),
    #[error("concurrent model update: pointer flip failed after {0} retries")]
    ConcurrentModelUpdate(u32),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

impl KindedError for MlmError {
    fn kind(&self) -> ErrorKind {
        match self {
            MlmError::ObjectStore(e) => e.kind(),
            MlmError::Sss(e) => e.kind(),
            MlmError::ConcurrentModelUpdate(_) => ErrorKind::Fatal,
            MlmError::Worker(e) => e.kind(),
        }
    }
}

pub struct ModelLifecycleManager {
    sss: SharedStateStore,
    os: ObjectStore,
    workers: Arc<dyn Workers>,
    tile_locks: PerTileLocks,
}

impl ModelLifecycleManager {
    pub fn new(sss: SharedStateStore, os: ObjectStore, workers: Arc<dyn Workers>) -> Self {
        Self { sss, os, workers, tile_locks: PerTileLocks::default() }
    }

    /// `get_latest_model(tile_id, region_tag)` — absence is a normal "no
    /// prior model" result, not an error.
    pub async fn get_latest_model(&self, tile_id: &str, region_tag: &str) -> Result<Option<TileModel>, MlmError> {
        let Some(version) = self.sss.get_latest_pointer(tile_id, region_tag).await? else {
            return Ok(None);
        };
        let metadata_key = keys::model_metadata(tile_id, region_tag, &version);
        let bytes = self.os.get(&metadata_key).await?;
        let metadata: ModelMetadata = serde_json::from_slice(&bytes).map_err(|e| {
            MlmError::ObjectStore(ObjectStoreError::Io(format!("corrupt model metadata: {e}")))
        })?;

        Ok(Some(TileModel {
            tile_id: metadata.tile_id,
            region_tag: metadata.region_tag,
            version: metadata.version,
            optimal_k: metadata.optimal_k,
            artifact_ref: metadata.model_ref,
            source_training_job: metadata.source_training_job,
            created_at: metadata.created_at,
            feature_dim: crate::config::defaults::FEATURE_DIM,
            is_latest: true,
        }))
    }

    /// `select_optimal_k(training_data_ref)` — the elbow method (spec §4.4).
    /// Launches one `cluster_trainer` invocation per candidate K in
    /// parallel, polls for completion, and runs [`elbow_pick`] over the
    /// successful results.
    pub async fn select_optimal_k(
        &self,
        training_data_ref: &str,
    ) -> (ElbowResult, Option<ElbowWarning>) {
        let k_candidates = &config::get().mlm.k_candidates;
        let jobs = k_candidates.iter().map(|&k| {
            let workers = self.workers.clone();
            let training_data_ref = training_data_ref.to_string();
            async move {
                workers
                    .cluster_trainer(ClusterTrainerRequest {
                        training_data_ref,
                        k,
                        feature_dim: crate::config::defaults::FEATURE_DIM,
                    })
                    .await
                    .map(|resp| KCandidateResult { k, sse: resp.sse })
            }
        });

        let outcomes: Vec<Result<KCandidateResult, WorkerError>> = futures::future::join_all(jobs).await;
        let successes: Vec<KCandidateResult> = outcomes.into_iter().filter_map(Result::ok).collect();

        if successes.len() == k_candidates.len() {
            return (elbow_pick(&successes), None);
        }

        if successes.len() >= 3 {
            tracing::warn!(
                succeeded = successes.len(),
                total = k_candidates.len(),
                "K-selection partial: some candidate jobs failed"
            );
            return (elbow_pick(&successes), Some(ElbowWarning::KSelectionPartial));
        }

        tracing::warn!(
            succeeded = successes.len(),
            "K-selection fallback: fewer than 3 candidates succeeded"
        );
        let fallback_k = config::get().mlm.fallback_k;
        (
            ElbowResult { optimal_k: fallback_k, confidence: 0.0, sse_curve: Vec::new() },
            Some(ElbowWarning::KSelectionFallback),
        )
    }

    /// `save_new_model(tile_id, region_tag, artifact, source_training_job,
    /// optimal_k)` — writes the artifact + metadata then atomically flips
    /// the `latest` pointer, retrying the conditional update on conflict.
    pub async fn save_new_model(
        &self,
        tile_id: &str,
        region_tag: &str,
        artifact: &[u8],
        source_training_job: &str,
        optimal_k: u32,
    ) -> Result<TileModel, MlmError> {
        let version = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();

        let artifact_key = keys::model_artifact(tile_id, region_tag, &version);
        let metadata_key = keys::model_metadata(tile_id, region_tag, &version);

        self.os.put(&artifact_key, artifact).await?;

        let metadata = ModelMetadata {
            tile_id: tile_id.to_string(),
            region_tag: region_tag.to_string(),
            version: version.clone(),
            optimal_k,
            model_ref: artifact_key.clone(),
            source_training_job: source_training_job.to_string(),
            created_at: Utc::now(),
        };
        let metadata_bytes = serde_json::to_vec(&metadata).map_err(|e| {
            MlmError::ObjectStore(ObjectStoreError::Io(format!("failed to serialize metadata: {e}")))
        })?;
        self.os.put(&metadata_key, &metadata_bytes).await?;

        let max_retries = config::get().mlm.max_pointer_flip_retries;
        let mut attempt = 0;
        loop {
            let expected = self.sss.get_latest_pointer(tile_id, region_tag).await?;
            match self
                .sss
                .swap_latest_pointer(tile_id, region_tag, expected.as_deref(), &version)
                .await
            {
                Ok(()) => break,
                Err(SssError::ConditionFailed) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(MlmError::ConcurrentModelUpdate(max_retries));
                    }
                    let backoff = 2_u64.pow(attempt.min(6)) * 10;
                    tokio::time::sleep(tokio::time::Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(MlmError::Sss(e)),
            }
        }

        Ok(TileModel {
            tile_id: tile_id.to_string(),
            region_tag: region_tag.to_string(),
            version,
            optimal_k,
            artifact_ref: artifact_key,
            source_training_job: source_training_job.to_string(),
            created_at: metadata.created_at,
            feature_dim: crate::config::defaults::FEATURE_DIM,
            is_latest: true,
        })
    }

    /// `track_performance(tile_id, metrics)` — non-fatal on OS I/O errors.
    pub async fn track_performance(&self, entry: crate::types::PerformanceEntry) {
        performance::track_performance(&self.os, &self.tile_locks, entry).await;
    }
}
