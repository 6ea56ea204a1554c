//! Built-in default values, matching the thresholds named in spec.md.

/// K-means candidate set for the elbow method (spec §4.4 step 1).
pub const K_CANDIDATES: [u32; 5] = [2, 3, 4, 5, 6];

/// Fallback K when fewer than 3 candidate jobs succeed (spec §4.4 step 7b).
pub const FALLBACK_K: u32 = 3;

/// Bound on `optimal_k` (spec §3 TileModel invariant).
pub const MIN_K: u32 = 2;
pub const MAX_K: u32 = 10;

pub const MAX_POINTER_FLIP_RETRIES: u32 = 5;
pub const PERFORMANCE_HISTORY_LIMIT: usize = 1_000;

/// Feature dimensionality of a pixel vector (spec §3).
pub const FEATURE_DIM: usize = 5;

pub const MAX_PARALLEL_IMAGES: usize = 5;
pub const MAX_TRANSITION_PAYLOAD_BYTES: usize = 256 * 1024;
pub const RUN_TIMEOUT_SECS: u64 = 30 * 60;

pub const SCHEDULER_CLAIM_TTL_SECS: u64 = 60;
pub const SCHEDULER_RETENTION_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;
pub const SCHEDULER_QUEUE_WORKERS: usize = 4;

/// Expected valid-pixel count for one fully-analyzed tile image, used as the
/// denominator for the data-quality confidence term (spec §4.7 step 4:
/// "fraction of valid pixels across all images").
pub const NOMINAL_PIXELS_PER_TILE: u64 = 50_000;

pub const WEIGHT_DATA_QUALITY: f64 = 0.30;
pub const WEIGHT_SPATIAL_COHERENCE: f64 = 0.25;
pub const WEIGHT_TEMPORAL_ACCURACY: f64 = 0.20;
pub const WEIGHT_MODEL_AGREEMENT: f64 = 0.25;
pub const NOMINAL_REVISIT_DAYS: f64 = 5.0;

pub const CONNECTION_POOL_LIMIT: usize = 100;
pub const CACHE_TTL_SECS: u64 = 5 * 60;

/// Risk classification thresholds on `deforestation_percentage` (spec §4.7).
pub const RISK_THRESHOLD_CRITICAL: f64 = 15.0;
pub const RISK_THRESHOLD_HIGH: f64 = 10.0;
pub const RISK_THRESHOLD_MODERATE: f64 = 5.0;
pub const RISK_THRESHOLD_LOW: f64 = 3.0;

/// Cluster-shift degradation thresholds (spec §4.7 step 3).
pub const DEGRADATION_NDVI_DROP: f64 = 0.15;
pub const DEGRADATION_SHARE_GROWTH_PCT: f64 = 5.0;

pub const MAX_HEATMAP_POINTS: usize = 10_000;
