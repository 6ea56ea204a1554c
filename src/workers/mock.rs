//! `MockWorkers` — an in-process stand-in for the real task-worker fleet,
//! used by the CLI demo and integration tests. Deterministic: the same
//! request always yields the same response, so end-to-end runs are
//! reproducible without a network.

use super::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One synthetic satellite pass a [`MockWorkers`] instance will hand back
/// from `search_images`, paired with the NDVI mean `vegetation_analyzer`
/// should report for it.
#[derive(Debug, Clone)]
pub struct MockImage {
    pub id: String,
    pub mean_ndvi: f64,
    pub vegetation_coverage: f64,
}

pub struct MockWorkers {
    images: Vec<MockImage>,
    sse_by_k: BTreeMap<u32, f64>,
    calls: AtomicUsize,
}

impl MockWorkers {
    pub fn new(images: Vec<MockImage>) -> Self {
        Self {
            images,
            sse_by_k: [(2, 1000.0), (3, 600.0), (4, 580.0), (5, 570.0), (6, 565.0)].into_iter().collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Workers for MockWorkers {
    async fn search_images(&self, req: SearchImagesRequest) -> Result<SearchImagesResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = chrono::NaiveDate::parse_from_str(&req.start_date, "%Y-%m-%d").ok();
        let images = self
            .images
            .iter()
            .enumerate()
            .map(|(i, img)| SatelliteImage {
                id: img.id.clone(),
                // Configured images are deemed earliest-first; spread them a
                // week apart so sorting by capture date is deterministic
                // regardless of the order per-image branches complete in.
                date: start
                    .and_then(|d| d.checked_add_days(chrono::Days::new(i as u64 * 7)))
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| req.start_date.clone()),
                assets: ImageAssets {
                    red_url: format!("mock://red/{}", img.id),
                    nir_url: format!("mock://nir/{}", img.id),
                },
                cloud_cover: req.cloud_cover.min(19.0),
                bbox: [req.longitude - 0.1, req.latitude - 0.1, req.longitude + 0.1, req.latitude + 0.1],
            })
            .collect::<Vec<_>>();
        Ok(SearchImagesResponse { count: images.len(), images })
    }

    async fn vegetation_analyzer(&self, req: VegetationAnalyzerRequest) -> Result<VegetationAnalyzerResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(img) = self.images.iter().find(|i| i.id == req.image_id) else {
            return Err(WorkerError::Validation(format!("unknown image {}", req.image_id)));
        };
        Ok(VegetationAnalyzerResponse {
            success: true,
            statistics: NdviStatistics {
                mean_ndvi: img.mean_ndvi,
                min_ndvi: img.mean_ndvi - 0.2,
                max_ndvi: img.mean_ndvi + 0.1,
                std_ndvi: 0.08,
                vegetation_coverage: img.vegetation_coverage,
                valid_pixels: 50_000,
            },
            training_data_ref: format!("geospatial-data/mock/{}.json", img.id),
        })
    }

    async fn k_selector(&self, req: KSelectorRequest) -> Result<KSelectorResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sse_by_k: BTreeMap<u32, f64> = req.k_candidates.iter().map(|k| (*k, self.sse_by_k.get(k).copied().unwrap_or(500.0))).collect();
        Ok(KSelectorResponse { optimal_k: 3, confidence: 0.8, sse_by_k })
    }

    async fn cluster_trainer(&self, req: ClusterTrainerRequest) -> Result<ClusterTrainerResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sse = self.sse_by_k.get(&req.k).copied().unwrap_or(500.0);
        let vegetated_ndvi = self.images.iter().map(|i| i.mean_ndvi).fold(0.0, f64::max);
        let bare_ndvi = self.images.iter().map(|i| i.mean_ndvi).fold(1.0, f64::min) - 0.3;
        Ok(ClusterTrainerResponse {
            model_artifact_ref: format!("mock-model-k{}", req.k),
            sse,
            cluster_centroids: vec![vec![vegetated_ndvi, 0.0, 0.0, 0.0, 0.0], vec![bare_ndvi, 0.0, 0.0, 0.0, 0.0]],
            cluster_sizes: vec![800, 200],
        })
    }

    async fn visualization_generator(&self, req: VisualizationRequest) -> Result<VisualizationResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(VisualizationResponse {
            chart_refs: vec![crate::objstore::keys::visualization(&req.region_id, &req.tile_id, req.timestamp, "ndvi_heatmap")],
        })
    }

    async fn results_consolidator(&self, req: ResultsConsolidatorRequest) -> Result<ResultsConsolidatorResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ResultsConsolidatorResponse {
            risk_level: "MODERATE".to_string(),
            email_payload: req.per_image_results,
            report_ref: format!("reports/mock/{}.pdf", req.region_id),
        })
    }

    async fn notifier(&self, _req: NotifierRequest) -> Result<NotifierResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(NotifierResponse { delivered: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_images_returns_configured_set() {
        let workers = MockWorkers::new(vec![MockImage { id: "img-1".to_string(), mean_ndvi: 0.8, vegetation_coverage: 0.9 }]);
        let resp = workers
            .search_images(SearchImagesRequest { latitude: -6.0, longitude: -53.0, start_date: "2022-06-01".to_string(), end_date: "2022-09-01".to_string(), cloud_cover: 20.0 })
            .await
            .unwrap();
        assert_eq!(resp.count, 1);
    }

    #[tokio::test]
    async fn vegetation_analyzer_rejects_unknown_image() {
        let workers = MockWorkers::new(Vec::new());
        let err = workers
            .vegetation_analyzer(VegetationAnalyzerRequest {
                image_id: "missing".to_string(),
                red_url: String::new(),
                nir_url: String::new(),
                output_bucket: String::new(),
                region: "r1".to_string(),
            })
            .await
            .unwrap_err();
        matches!(err, WorkerError::Validation(_));
    }
}
