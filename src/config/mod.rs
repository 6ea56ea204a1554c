//! Core configuration.
//!
//! Loaded once at startup and read from anywhere via [`get`], following the
//! same global-init idiom as a well-configuration module would: an
//! environment variable names an override file, falling back to a file in
//! the current directory, falling back to built-in defaults.
//!
//! ## Usage
//!
//! ```ignore
//! config::init(CoreConfig::load());
//! let max_parallel = config::get().orchestrator.max_parallel_images;
//! ```

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();

/// Initialize the global configuration. Must be called exactly once before
/// any call to [`get`].
pub fn init(config: CoreConfig) {
    if CORE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Panics if [`init`] has not been called — a missing config is a fatal
/// startup error, not a recoverable condition.
pub fn get() -> &'static CoreConfig {
    CORE_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Whether the config has been initialized. Useful for tests.
pub fn is_initialized() -> bool {
    CORE_CONFIG.get().is_some()
}

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub orchestrator: OrchestratorConfig,
    pub mlm: MlmConfig,
    pub scheduler: SchedulerConfig,
    pub consolidator: ConsolidatorConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            mlm: MlmConfig::default(),
            scheduler: SchedulerConfig::default(),
            consolidator: ConsolidatorConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load order: `FORESTSHIELD_CONFIG` env var path, then `forestshield.toml`
    /// in the current directory, then built-in defaults.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("FORESTSHIELD_CONFIG") {
            match std::fs::read_to_string(&path) {
                Ok(text) => match toml::from_str(&text) {
                    Ok(cfg) => {
                        tracing::info!(path = %path, "loaded config from FORESTSHIELD_CONFIG");
                        return cfg;
                    }
                    Err(e) => tracing::warn!(path = %path, error = %e, "failed to parse config"),
                },
                Err(e) => tracing::warn!(path = %path, error = %e, "failed to read config"),
            }
        }

        if let Ok(text) = std::fs::read_to_string("forestshield.toml") {
            match toml::from_str(&text) {
                Ok(cfg) => {
                    tracing::info!("loaded config from ./forestshield.toml");
                    return cfg;
                }
                Err(e) => tracing::warn!(error = %e, "failed to parse ./forestshield.toml"),
            }
        }

        tracing::info!("using built-in default configuration");
        Self::default()
    }
}

/// Retry policy shared by every task-invoking orchestrator state (spec §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_parallel_images: usize,
    pub retry: RetryPolicy,
    pub max_transition_payload_bytes: usize,
    pub run_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_images: defaults::MAX_PARALLEL_IMAGES,
            retry: RetryPolicy::default(),
            max_transition_payload_bytes: defaults::MAX_TRANSITION_PAYLOAD_BYTES,
            run_timeout_secs: defaults::RUN_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlmConfig {
    pub k_candidates: Vec<u32>,
    pub fallback_k: u32,
    pub max_pointer_flip_retries: u32,
    pub performance_history_limit: usize,
}

impl Default for MlmConfig {
    fn default() -> Self {
        Self {
            k_candidates: defaults::K_CANDIDATES.to_vec(),
            fallback_k: defaults::FALLBACK_K,
            max_pointer_flip_retries: defaults::MAX_POINTER_FLIP_RETRIES,
            performance_history_limit: defaults::PERFORMANCE_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub claim_ttl_secs: u64,
    pub retention_window_secs: i64,
    pub queue_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: defaults::SCHEDULER_CLAIM_TTL_SECS,
            retention_window_secs: defaults::SCHEDULER_RETENTION_WINDOW_SECS,
            queue_workers: defaults::SCHEDULER_QUEUE_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidatorConfig {
    pub weight_data_quality: f64,
    pub weight_spatial_coherence: f64,
    pub weight_temporal_accuracy: f64,
    pub weight_model_agreement: f64,
    pub nominal_revisit_days: f64,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            weight_data_quality: defaults::WEIGHT_DATA_QUALITY,
            weight_spatial_coherence: defaults::WEIGHT_SPATIAL_COHERENCE,
            weight_temporal_accuracy: defaults::WEIGHT_TEMPORAL_ACCURACY,
            weight_model_agreement: defaults::WEIGHT_MODEL_AGREEMENT,
            nominal_revisit_days: defaults::NOMINAL_REVISIT_DAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub connection_pool_limit: usize,
    pub cache_ttl_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connection_pool_limit: defaults::CONNECTION_POOL_LIMIT,
            cache_ttl_secs: defaults::CACHE_TTL_SECS,
        }
    }
}
