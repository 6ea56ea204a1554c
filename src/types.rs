//! Core data model (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-declared area to monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub region_id: String,
    pub name: String,
    pub center: GeoPoint,
    pub radius_km: f64,
    pub cloud_cover_threshold: f64,
    pub status: RegionStatus,
    pub created_at: DateTime<Utc>,
    pub last_deforestation_percentage: Option<f64>,
    pub last_analysis_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionStatus {
    Active,
    Paused,
}

impl Region {
    /// Validate the invariants from spec.md §3. Returns the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if !(-90.0..=90.0).contains(&self.center.latitude) {
            return Err(format!("latitude {} out of range [-90,90]", self.center.latitude));
        }
        if !(-180.0..=180.0).contains(&self.center.longitude) {
            return Err(format!("longitude {} out of range [-180,180]", self.center.longitude));
        }
        if self.radius_km <= 0.0 {
            return Err(format!("radius_km {} must be > 0", self.radius_km));
        }
        if !(0.0..=100.0).contains(&self.cloud_cover_threshold) {
            return Err(format!(
                "cloud_cover_threshold {} out of range [0,100]",
                self.cloud_cover_threshold
            ));
        }
        Ok(())
    }
}

/// A persisted deforestation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub region_id: String,
    pub region_name: String,
    pub level: AlertLevel,
    pub deforestation_percentage: f64,
    pub confidence_score: f64,
    pub message: String,
    pub acknowledged: bool,
    pub timestamp: DateTime<Utc>,
    /// Deduplication key `(region_id, floor(timestamp to nearest hour))`, see spec §4.7 step 5.
    pub dedup_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Info,
    Low,
    Moderate,
    High,
    Critical,
}

impl AlertLevel {
    /// Classify risk from a deforestation percentage per spec.md §4.7 step 2.
    pub fn classify(deforestation_pct: f64) -> Self {
        let d = crate::config::defaults::RISK_THRESHOLD_CRITICAL;
        let h = crate::config::defaults::RISK_THRESHOLD_HIGH;
        let m = crate::config::defaults::RISK_THRESHOLD_MODERATE;
        let l = crate::config::defaults::RISK_THRESHOLD_LOW;
        if deforestation_pct > d {
            AlertLevel::Critical
        } else if deforestation_pct > h {
            AlertLevel::High
        } else if deforestation_pct > m {
            AlertLevel::Moderate
        } else if deforestation_pct > l {
            AlertLevel::Low
        } else {
            AlertLevel::Info
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Low => "LOW",
            AlertLevel::Moderate => "MODERATE",
            AlertLevel::High => "HIGH",
            AlertLevel::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// A trained K-means model artifact for a `(tile_id, region_tag)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileModel {
    pub tile_id: String,
    pub region_tag: String,
    pub version: String,
    pub optimal_k: u32,
    pub artifact_ref: String,
    pub source_training_job: String,
    pub created_at: DateTime<Utc>,
    pub feature_dim: usize,
    pub is_latest: bool,
}

/// Model metadata JSON persisted alongside the artifact (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub tile_id: String,
    pub region_tag: String,
    pub version: String,
    pub optimal_k: u32,
    pub model_ref: String,
    pub source_training_job: String,
    pub created_at: DateTime<Utc>,
}

/// A single analysis outcome used for per-tile performance tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub tile_id: String,
    pub timestamp: DateTime<Utc>,
    pub overall_confidence: f64,
    pub data_quality: f64,
    pub spatial_coherence: f64,
    pub historical_consistency: f64,
    pub processing_time_ms: u64,
    pub pixels_analyzed: u64,
    pub model_reused: bool,
    pub training_job_name: String,
    pub anomalies: Vec<AnomalyFlag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub severity: AnomalySeverity,
    pub component: String,
    pub detail: String,
}

/// Scheduler's registration of a region's cron (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub region_id: String,
    pub cron_expression: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub owner_replica_id: String,
    pub is_running: bool,
}

/// An in-flight or completed orchestrator execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: String,
    pub region_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Durable checkpoint: the orchestrator state machine's current state tag.
    pub current_state: String,
    pub state_input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
    NoImagesFound,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::TimedOut | RunStatus::NoImagesFound
        )
    }
}

/// 5-dimensional training input: `[ndvi, red, nir, latitude, longitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelVector {
    pub ndvi: f64,
    pub red: i64,
    pub nir: i64,
    pub latitude: f64,
    pub longitude: f64,
}

/// The on-disk training-data JSON shape (spec §6): `{"pixels": [[...], ...]}`.
/// No schema version — non-conforming files must be rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelVectorFile {
    pub pixels: Vec<[f64; 5]>,
}

impl PixelVectorFile {
    pub fn into_vectors(self) -> Vec<PixelVector> {
        self.pixels
            .into_iter()
            .map(|p| PixelVector {
                ndvi: p[0],
                red: p[1] as i64,
                nir: p[2] as i64,
                latitude: p[3],
                longitude: p[4],
            })
            .collect()
    }
}

/// Lightweight record of an end-to-end scenario test outcome, stored in SSS
/// (supplemented entity, see SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationTestRecord {
    pub run_id: String,
    pub scenario_name: String,
    pub passed: bool,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}
