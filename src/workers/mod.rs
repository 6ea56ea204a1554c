//! Task worker invocation protocol — spec.md §6.
//!
//! Workers are black-box functions with a declared input/output schema,
//! invoked through one abstract trait. Production workers live outside this
//! crate (compute clusters, the STAC client, the report renderer); this
//! module only defines the contract and a `MockWorkers` test/demo double.

pub mod mock;

use crate::error::{ErrorKind, KindedError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl KindedError for WorkerError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Validation(_) => ErrorKind::Validation,
            WorkerError::Transient(_) => ErrorKind::Transient,
            WorkerError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

// ─── search_images ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchImagesRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub start_date: String,
    pub end_date: String,
    pub cloud_cover: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAssets {
    pub red_url: String,
    pub nir_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteImage {
    pub id: String,
    pub date: String,
    pub assets: ImageAssets,
    pub cloud_cover: f64,
    pub bbox: [f64; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchImagesResponse {
    pub count: usize,
    pub images: Vec<SatelliteImage>,
}

// ─── vegetation_analyzer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VegetationAnalyzerRequest {
    pub image_id: String,
    pub red_url: String,
    pub nir_url: String,
    pub output_bucket: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdviStatistics {
    pub mean_ndvi: f64,
    pub min_ndvi: f64,
    pub max_ndvi: f64,
    pub std_ndvi: f64,
    pub vegetation_coverage: f64,
    pub valid_pixels: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VegetationAnalyzerResponse {
    pub success: bool,
    pub statistics: NdviStatistics,
    pub training_data_ref: String,
}

// ─── k_selector ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KSelectorRequest {
    pub training_data_ref: String,
    pub k_candidates: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KSelectorResponse {
    pub optimal_k: u32,
    pub confidence: f64,
    pub sse_by_k: std::collections::BTreeMap<u32, f64>,
}

// ─── cluster_trainer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTrainerRequest {
    pub training_data_ref: String,
    pub k: u32,
    pub feature_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTrainerResponse {
    pub model_artifact_ref: String,
    pub sse: f64,
    pub cluster_centroids: Vec<Vec<f64>>,
    pub cluster_sizes: Vec<u64>,
}

// ─── visualization_generator ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationRequest {
    pub model_artifact_ref: String,
    pub training_data_ref: String,
    pub tile_id: String,
    pub region_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationResponse {
    pub chart_refs: Vec<String>,
}

// ─── results_consolidator ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConsolidatorRequest {
    pub per_image_results: serde_json::Value,
    pub region_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConsolidatorResponse {
    pub risk_level: String,
    pub email_payload: serde_json::Value,
    pub report_ref: String,
}

// ─── notifier ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierRequest {
    pub channel: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierResponse {
    pub delivered: bool,
}

/// Abstract invocation surface: `invoke(worker_name, payload) -> result | error`,
/// expressed here as one typed method per declared worker so callers get
/// compile-time payload checking instead of stringly-typed dispatch.
#[async_trait]
pub trait Workers: Send + Sync {
    async fn search_images(&self, req: SearchImagesRequest) -> Result<SearchImagesResponse, WorkerError>;
    async fn vegetation_analyzer(&self, req: VegetationAnalyzerRequest) -> Result<VegetationAnalyzerResponse, WorkerError>;
    async fn k_selector(&self, req: KSelectorRequest) -> Result<KSelectorResponse, WorkerError>;
    async fn cluster_trainer(&self, req: ClusterTrainerRequest) -> Result<ClusterTrainerResponse, WorkerError>;
    async fn visualization_generator(&self, req: VisualizationRequest) -> Result<VisualizationResponse, WorkerError>;
    async fn results_consolidator(&self, req: ResultsConsolidatorRequest) -> Result<ResultsConsolidatorResponse, WorkerError>;
    async fn notifier(&self, req: NotifierRequest) -> Result<NotifierResponse, WorkerError>;
}
