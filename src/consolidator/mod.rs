//! Results Consolidator (RC) — spec.md §4.7.
//!
//! Aggregates per-image analysis outcomes into risk classification, runs
//! cluster-shift change detection, scores confidence, and writes the
//! deduplicated Alert. Unlike the black-box task workers in [`crate::workers`],
//! this algorithm runs in-core: the input/output shapes mirror the
//! `results_consolidator` worker contract, but classification and alerting
//! happen here, not behind an external call.

use crate::config;
use crate::config::defaults::{DEGRADATION_NDVI_DROP, DEGRADATION_SHARE_GROWTH_PCT, NOMINAL_PIXELS_PER_TILE};
use crate::error::{ErrorKind, KindedError};
use crate::mlm::{track_performance, PerTileLocks};
use crate::objstore::ObjectStore;
use crate::sss::{SharedStateStore, SssError};
use crate::types::{Alert, AlertLevel, PerformanceEntry};
use crate::workers::{NdviStatistics, NotifierRequest, Workers};
use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConsolidatorError {
    #[error("shared state store error: {0}")]
    Sss(#[from] SssError),
    #[error("no successful images to consolidate")]
    NoSuccessfulImages,
}

impl KindedError for ConsolidatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConsolidatorError::Sss(e) => e.kind(),
            ConsolidatorError::NoSuccessfulImages => ErrorKind::Validation,
        }
    }
}

/// One per-image outcome, as produced by the AO's `MapPerImage` fan-out.
#[derive(Debug, Clone)]
pub struct ImageResult {
    pub image_id: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub statistics: Option<NdviStatistics>,
    /// NDVI-dimension centroid per cluster (index 0 of each 5-dim centroid).
    pub cluster_ndvi_centroids: Option<Vec<f64>>,
    pub cluster_sizes: Option<Vec<u64>>,
    pub model_used: Option<String>,
    pub processing_time_ms: u64,
    pub tile_id: String,
}

#[derive(Debug, Clone)]
pub struct ConsolidationOutcome {
    pub mean_vegetation_coverage: f64,
    pub mean_ndvi: f64,
    pub total_pixels: u64,
    pub deforestation_percentage: f64,
    pub risk_level: AlertLevel,
    pub confidence_score: f64,
    pub alert: Option<Alert>,
}

struct DegradationShift {
    cluster_index: usize,
    ndvi_centroid: f64,
}

pub struct ResultsConsolidator {
    sss: SharedStateStore,
    os: ObjectStore,
    workers: Arc<dyn Workers>,
    tile_locks: PerTileLocks,
}

impl ResultsConsolidator {
    pub fn new(sss: SharedStateStore, os: ObjectStore, workers: Arc<dyn Workers>) -> Self {
        Self { sss, os, workers, tile_locks: PerTileLocks::default() }
    }

    /// Run the full §4.7 algorithm. `region_id`/`region_name` identify the
    /// region the alert (if any) belongs to.
    pub async fn consolidate(
        &self,
        region_id: &str,
        region_name: &str,
        results: &[ImageResult],
    ) -> Result<ConsolidationOutcome, ConsolidatorError> {
        let successes: Vec<&ImageResult> = results.iter().filter(|r| r.success).collect();
        if successes.is_empty() {
            return Err(ConsolidatorError::NoSuccessfulImages);
        }

        // Step 1: aggregate stats.
        let mean_vegetation_coverage = mean(successes.iter().filter_map(|r| r.statistics.as_ref()).map(|s| s.vegetation_coverage));
        let mean_ndvi = mean(successes.iter().filter_map(|r| r.statistics.as_ref()).map(|s| s.mean_ndvi));
        let total_pixels: u64 = successes.iter().filter_map(|r| r.statistics.as_ref()).map(|s| s.valid_pixels).sum();

        // Step 3: cluster-shift change detection (requires >= 2 images).
        let mut sorted: Vec<&ImageResult> = successes.clone();
        sorted.sort_by_key(|r| r.timestamp);

        let mut shifts: Vec<DegradationShift> = Vec::new();
        let mut coverage_initial = None;
        let mut coverage_final = None;

        if sorted.len() >= 2 {
            coverage_initial = sorted.first().and_then(|r| r.statistics.as_ref()).map(|s| s.vegetation_coverage);
            coverage_final = sorted.last().and_then(|r| r.statistics.as_ref()).map(|s| s.vegetation_coverage);

            for (i, pair) in sorted.windows(2).enumerate() {
                let (prev, curr) = (pair[0], pair[1]);
                let (Some(prev_centroids), Some(curr_centroids)) =
                    (&prev.cluster_ndvi_centroids, &curr.cluster_ndvi_centroids)
                else {
                    continue;
                };
                let (Some(prev_sizes), Some(curr_sizes)) = (&prev.cluster_sizes, &curr.cluster_sizes) else {
                    continue;
                };
                if prev_centroids.len() != curr_centroids.len() {
                    continue;
                }
                let prev_total: u64 = prev_sizes.iter().sum();
                let curr_total: u64 = curr_sizes.iter().sum();
                if prev_total == 0 || curr_total == 0 {
                    continue;
                }

                for cluster_index in 0..curr_centroids.len() {
                    let ndvi_delta = curr_centroids[cluster_index] - prev_centroids[cluster_index];
                    let prev_share = prev_sizes[cluster_index] as f64 / prev_total as f64 * 100.0;
                    let curr_share = curr_sizes[cluster_index] as f64 / curr_total as f64 * 100.0;
                    let share_growth = curr_share - prev_share;

                    if ndvi_delta <= -DEGRADATION_NDVI_DROP && share_growth >= DEGRADATION_SHARE_GROWTH_PCT {
                        tracing::debug!(image_index = i + 1, cluster_index, ndvi_delta, share_growth, "cluster degradation shift detected");
                        shifts.push(DegradationShift { cluster_index, ndvi_centroid: curr_centroids[cluster_index] });
                    }
                }
            }
        }

        let deforestation_percentage = match (coverage_initial, coverage_final) {
            (Some(initial), Some(final_)) => ((initial - final_) * 100.0).max(0.0),
            _ => 0.0,
        };

        // Step 2: risk classification.
        let risk_level = AlertLevel::classify(deforestation_percentage);

        // Step 4: confidence scoring.
        let cfg = config::get().consolidator;

        // Fraction of valid pixels across all images, not fraction of images
        // that succeeded — a tile that succeeds but returns a half-empty
        // scene (cloud-masked pixels, sensor gaps) is lower quality than one
        // that fully validates.
        let valid_pixels: u64 = successes.iter().filter_map(|r| r.statistics.as_ref()).map(|s| s.valid_pixels).sum();
        let expected_pixels = results.len() as u64 * NOMINAL_PIXELS_PER_TILE;
        let data_quality = if expected_pixels == 0 { 0.0 } else { (valid_pixels as f64 / expected_pixels as f64).clamp(0.0, 1.0) };

        let spatial_coherence = if shifts.is_empty() {
            1.0
        } else {
            let centroids: Vec<f64> = shifts.iter().map(|s| s.ndvi_centroid).collect();
            1.0 - std_dev(&centroids).clamp(0.0, 1.0)
        };

        let span_days = match (sorted.first(), sorted.last()) {
            (Some(first), Some(last)) if sorted.len() >= 2 => {
                (last.timestamp - first.timestamp).num_seconds() as f64 / 86_400.0
            }
            _ => 0.0,
        };
        let temporal_accuracy = (span_days / cfg.nominal_revisit_days).clamp(0.0, 1.0);

        let model_agreement = if shifts.is_empty() {
            1.0
        } else {
            let mode = mode_cluster_index(&shifts);
            let agreeing = shifts.iter().filter(|s| s.cluster_index == mode).count();
            agreeing as f64 / shifts.len() as f64
        };

        let confidence_score = cfg.weight_data_quality * data_quality
            + cfg.weight_spatial_coherence * spatial_coherence
            + cfg.weight_temporal_accuracy * temporal_accuracy
            + cfg.weight_model_agreement * model_agreement;

        // Step 5: write a deduplicated alert if level != INFO.
        let alert = if risk_level != AlertLevel::Info {
            Some(
                self.write_alert(region_id, region_name, risk_level, deforestation_percentage, confidence_score)
                    .await?,
            )
        } else {
            None
        };

        // Step 6: asynchronously track performance for every image.
        for result in results {
            let Some(stats) = &result.statistics else { continue };
            let entry = PerformanceEntry {
                tile_id: result.tile_id.clone(),
                timestamp: result.timestamp,
                overall_confidence: confidence_score,
                data_quality: stats.vegetation_coverage,
                spatial_coherence,
                historical_consistency: if result.success { 1.0 } else { 0.0 },
                processing_time_ms: result.processing_time_ms,
                pixels_analyzed: stats.valid_pixels,
                model_reused: result.model_used.is_some(),
                training_job_name: result.model_used.clone().unwrap_or_default(),
                anomalies: Vec::new(),
            };
            track_performance(&self.os, &self.tile_locks, entry).await;
        }

        // Step 7: emit a notification event.
        if let Some(alert) = &alert {
            let _ = self
                .workers
                .notifier(NotifierRequest {
                    channel: "alerts".to_string(),
                    subject: format!("{} deforestation alert: {}", alert.level, region_name),
                    body: alert.message.clone(),
                })
                .await;
        }

        Ok(ConsolidationOutcome {
            mean_vegetation_coverage,
            mean_ndvi,
            total_pixels,
            deforestation_percentage,
            risk_level,
            confidence_score,
            alert,
        })
    }

    async fn write_alert(
        &self,
        region_id: &str,
        region_name: &str,
        level: AlertLevel,
        deforestation_percentage: f64,
        confidence_score: f64,
    ) -> Result<Alert, ConsolidatorError> {
        let timestamp = Utc::now();
        let floored_hour = timestamp
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .expect("zeroing minute/second/nanosecond of a valid DateTime never fails");
        let dedup_key = format!("{region_id}#{}", floored_hour.to_rfc3339());

        let alert = Alert {
            alert_id: Uuid::new_v4().to_string(),
            region_id: region_id.to_string(),
            region_name: region_name.to_string(),
            level,
            deforestation_percentage,
            confidence_score,
            message: format!(
                "{level} risk: {deforestation_percentage:.1}% vegetation loss detected in {region_name}"
            ),
            acknowledged: false,
            timestamp,
            dedup_key: dedup_key.clone(),
        };

        match self.sss.put_alert_deduplicated(&alert).await? {
            true => Ok(alert),
            false => {
                // Another consolidation run already wrote this hour's alert;
                // idempotence means returning the existing record, not an error.
                self.sss
                    .query_alerts_by_region(region_id)
                    .await?
                    .into_iter()
                    .find(|a| a.dedup_key == dedup_key)
                    .ok_or(ConsolidatorError::Sss(SssError::NotFound))
            }
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn mode_cluster_index(shifts: &[DegradationShift]) -> usize {
    let mut counts = std::collections::HashMap::new();
    for s in shifts {
        *counts.entry(s.cluster_index).or_insert(0usize) += 1;
    }
    counts.into_iter().max_by_key(|(_, count)| *count).map(|(idx, _)| idx).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::{
        ClusterTrainerRequest, ClusterTrainerResponse, KSelectorRequest, KSelectorResponse,
        NotifierResponse, ResultsConsolidatorRequest, ResultsConsolidatorResponse,
        SearchImagesRequest, SearchImagesResponse, VegetationAnalyzerRequest,
        VegetationAnalyzerResponse, VisualizationRequest, VisualizationResponse, WorkerError,
    };
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    struct NoopWorkers;

    #[async_trait]
    impl Workers for NoopWorkers {
        async fn search_images(&self, _: SearchImagesRequest) -> Result<SearchImagesResponse, WorkerError> {
            unimplemented!()
        }
        async fn vegetation_analyzer(&self, _: VegetationAnalyzerRequest) -> Result<VegetationAnalyzerResponse, WorkerError> {
            unimplemented!()
        }
        async fn k_selector(&self, _: KSelectorRequest) -> Result<KSelectorResponse, WorkerError> {
            unimplemented!()
        }
        async fn cluster_trainer(&self, _: ClusterTrainerRequest) -> Result<ClusterTrainerResponse, WorkerError> {
            unimplemented!()
        }
        async fn visualization_generator(&self, _: VisualizationRequest) -> Result<VisualizationResponse, WorkerError> {
            unimplemented!()
        }
        async fn results_consolidator(&self, _: ResultsConsolidatorRequest) -> Result<ResultsConsolidatorResponse, WorkerError> {
            unimplemented!()
        }
        async fn notifier(&self, _: NotifierRequest) -> Result<NotifierResponse, WorkerError> {
            Ok(NotifierResponse { delivered: true })
        }
    }

    fn ensure_config() {
        if !config::is_initialized() {
            config::init(config::CoreConfig::default());
        }
    }

    fn stats(mean_ndvi: f64, coverage: f64) -> NdviStatistics {
        NdviStatistics {
            mean_ndvi,
            min_ndvi: mean_ndvi - 0.1,
            max_ndvi: mean_ndvi + 0.1,
            std_ndvi: 0.05,
            vegetation_coverage: coverage,
            valid_pixels: 10_000,
        }
    }

    #[tokio::test]
    async fn scenario_s1_moderate_alert() {
        ensure_config();
        let (sss, _d1) = SharedStateStore::open_temp();
        let (os, _d2) = ObjectStore::open_temp();
        let rc = ResultsConsolidator::new(sss, os, Arc::new(NoopWorkers));

        let t0 = Utc::now() - ChronoDuration::days(90);
        let t1 = Utc::now();

        let results = vec![
            ImageResult {
                image_id: "img-1".to_string(),
                success: true,
                timestamp: t0,
                statistics: Some(stats(0.85, 0.92)),
                cluster_ndvi_centroids: Some(vec![0.9, 0.2]),
                cluster_sizes: Some(vec![900, 100]),
                model_used: None,
                processing_time_ms: 500,
                tile_id: "r1".to_string(),
            },
            ImageResult {
                image_id: "img-2".to_string(),
                success: true,
                timestamp: t1,
                statistics: Some(stats(0.45, 0.85)),
                cluster_ndvi_centroids: Some(vec![0.7, 0.2]),
                cluster_sizes: Some(vec![800, 200]),
                model_used: None,
                processing_time_ms: 500,
                tile_id: "r1".to_string(),
            },
        ];

        let outcome = rc.consolidate("r1", "Region One", &results).await.unwrap();
        assert!(outcome.deforestation_percentage >= 5.0 && outcome.deforestation_percentage <= 10.0);
        assert_eq!(outcome.risk_level, AlertLevel::Moderate);
        assert!(outcome.alert.is_some());
    }

    #[tokio::test]
    async fn idempotent_rerun_hits_dedup_key() {
        ensure_config();
        let (sss, _d1) = SharedStateStore::open_temp();
        let (os, _d2) = ObjectStore::open_temp();
        let rc = ResultsConsolidator::new(sss, os, Arc::new(NoopWorkers));

        let results = vec![ImageResult {
            image_id: "img-1".to_string(),
            success: true,
            timestamp: Utc::now(),
            statistics: Some(stats(0.3, 0.3)),
            cluster_ndvi_centroids: None,
            cluster_sizes: None,
            model_used: None,
            processing_time_ms: 100,
            tile_id: "r1".to_string(),
        }];

        let first = rc.consolidate("r1", "Region One", &results).await.unwrap();
        let second = rc.consolidate("r1", "Region One", &results).await.unwrap();

        match (first.alert, second.alert) {
            (Some(a), Some(b)) => assert_eq!(a.alert_id, b.alert_id),
            _ => { /* INFO-level: no alert either time is also a valid idempotent outcome */ }
        }
    }

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean(std::iter::empty()), 0.0);
    }
}
