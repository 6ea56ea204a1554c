//! Per-tile performance tracking — spec.md §4.4 `track_performance`.

use crate::config::defaults::PERFORMANCE_HISTORY_LIMIT;
use crate::objstore::{keys, ObjectStore};
use crate::types::{AnomalyFlag, AnomalySeverity, PerformanceEntry};
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Serializes read-modify-write access to a tile's history blob in-process.
/// Cross-replica races are acceptable (spec §5): they only affect anomaly
/// statistics, never model correctness or alert emission.
#[derive(Default)]
pub struct PerTileLocks {
    locks: DashMap<String, std::sync::Arc<Mutex<()>>>,
}

impl PerTileLocks {
    fn lock_for(&self, tile_id: &str) -> std::sync::Arc<Mutex<()>> {
        self.locks
            .entry(tile_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
struct History {
    entries: Vec<PerformanceEntry>,
}

/// Append `entry` to the tile's history blob, computing anomaly flags.
/// OS I/O failures here are logged and swallowed — the orchestrator must
/// not depend on performance tracking for correctness (spec §4.4 failure
/// semantics).
pub async fn track_performance(
    os: &ObjectStore,
    locks: &PerTileLocks,
    mut entry: PerformanceEntry,
) {
    let guard = locks.lock_for(&entry.tile_id);
    let _held = guard.lock().await;

    let key = keys::model_performance_history(&entry.tile_id);

    let mut history = match os.get(&key).await {
        Ok(bytes) => serde_json::from_slice::<History>(&bytes).unwrap_or_default(),
        Err(_) => History::default(),
    };

    entry.anomalies = detect_anomalies(&history.entries, &entry);

    history.entries.push(entry);
    if history.entries.len() > PERFORMANCE_HISTORY_LIMIT {
        let overflow = history.entries.len() - PERFORMANCE_HISTORY_LIMIT;
        history.entries.drain(0..overflow);
    }

    let bytes = match serde_json::to_vec(&history) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize performance history — skipping");
            return;
        }
    };

    if let Err(e) = os.put(&key, &bytes).await {
        tracing::warn!(error = %e, "failed to write performance history — skipping (non-fatal)");
    }
}

/// `high_severity` when `overall_confidence < 0.3` or `processing_time_ms`
/// exceeds 3σ above the trailing-20 mean; `medium_severity` on a
/// single-component drop > 0.25 vs. the trailing mean (spec §4.4).
fn detect_anomalies(trailing: &[PerformanceEntry], entry: &PerformanceEntry) -> Vec<AnomalyFlag> {
    let mut flags = Vec::new();

    if entry.overall_confidence < 0.3 {
        flags.push(AnomalyFlag {
            severity: AnomalySeverity::High,
            component: "overall_confidence".to_string(),
            detail: format!("overall_confidence {:.3} below 0.3", entry.overall_confidence),
        });
    }

    let window: Vec<&PerformanceEntry> = trailing.iter().rev().take(20).collect();
    if window.len() >= 2 {
        let times: Vec<f64> = window.iter().map(|e| e.processing_time_ms as f64).collect();
        let mean = times.iter().sum::<f64>() / times.len() as f64;
        let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / times.len() as f64;
        let std_dev = variance.sqrt();

        let threshold = if std_dev > 0.0 { mean + 3.0 * std_dev } else { mean };
        if (entry.processing_time_ms as f64) > threshold {
            flags.push(AnomalyFlag {
                severity: AnomalySeverity::High,
                component: "processing_time_ms".to_string(),
                detail: format!(
                    "processing_time_ms {} exceeds 3σ above trailing mean {:.1}",
                    entry.processing_time_ms, mean
                ),
            });
        }

        for (name, value, trailing_values) in [
            ("data_quality", entry.data_quality, window.iter().map(|e| e.data_quality).collect::<Vec<_>>()),
            (
                "spatial_coherence",
                entry.spatial_coherence,
                window.iter().map(|e| e.spatial_coherence).collect::<Vec<_>>(),
            ),
            (
                "historical_consistency",
                entry.historical_consistency,
                window.iter().map(|e| e.historical_consistency).collect::<Vec<_>>(),
            ),
        ] {
            let trailing_mean = trailing_values.iter().sum::<f64>() / trailing_values.len() as f64;
            if trailing_mean - value > 0.25 {
                flags.push(AnomalyFlag {
                    severity: AnomalySeverity::Medium,
                    component: name.to_string(),
                    detail: format!("{name} {value:.3} dropped > 0.25 vs trailing mean {trailing_mean:.3}"),
                });
            }
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(tile: &str, confidence: f64, processing_ms: u64) -> PerformanceEntry {
        PerformanceEntry {
            tile_id: tile.to_string(),
            timestamp: Utc::now(),
            overall_confidence: confidence,
            data_quality: 0.9,
            spatial_coherence: 0.9,
            historical_consistency: 0.9,
            processing_time_ms: processing_ms,
            pixels_analyzed: 1000,
            model_reused: false,
            training_job_name: "job-1".to_string(),
            anomalies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn low_confidence_flags_high_severity() {
        let (os, _dir) = ObjectStore::open_temp();
        let locks = PerTileLocks::default();
        track_performance(&os, &locks, entry("t1", 0.2, 500)).await;

        let bytes = os.get(&keys::model_performance_history("t1")).await.unwrap();
        let history: History = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(history.entries.len(), 1);
        assert!(history.entries[0].anomalies.iter().any(|a| a.severity == AnomalySeverity::High));
    }

    #[tokio::test]
    async fn history_truncates_to_limit() {
        let (os, _dir) = ObjectStore::open_temp();
        let locks = PerTileLocks::default();
        for _ in 0..5 {
            track_performance(&os, &locks, entry("t1", 0.9, 500)).await;
        }

        let bytes = os.get(&keys::model_performance_history("t1")).await.unwrap();
        let history: History = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(history.entries.len(), 5);
    }

    #[tokio::test]
    async fn processing_time_spike_is_high_severity() {
        let (os, _dir) = ObjectStore::open_temp();
        let locks = PerTileLocks::default();
        for _ in 0..20 {
            track_performance(&os, &locks, entry("t1", 0.9, 500)).await;
        }
        track_performance(&os, &locks, entry("t1", 0.9, 50_000)).await;

        let bytes = os.get(&keys::model_performance_history("t1")).await.unwrap();
        let history: History = serde_json::from_slice(&bytes).unwrap();
        let last = history.entries.last().unwrap();
        assert!(last.anomalies.iter().any(|a| a.component == "processing_time_ms"));
    }
}
