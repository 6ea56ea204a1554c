//! End-to-end scenario tests driven against the in-process mock worker fleet
//! (spec.md §8). Each test exercises the public crate API the way a CLI
//! invocation or a real worker fleet would, with no network dependency.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use forestshield_core::ao::AnalysisOrchestrator;
use forestshield_core::config::{self, CoreConfig};
use forestshield_core::coordinator::{InMemoryCoordinator, SharedCoordinator};
use forestshield_core::objstore::ObjectStore;
use forestshield_core::scheduler::RegionScheduler;
use forestshield_core::sss::SharedStateStore;
use forestshield_core::types::{GeoPoint, IntegrationTestRecord, Region, RegionStatus, RunStatus};
use forestshield_core::workers::mock::{MockImage, MockWorkers};
use forestshield_core::workers::Workers;
use std::sync::Arc;
use std::sync::Once;

static INIT: Once = Once::new();

fn ensure_config() {
    INIT.call_once(|| {
        if !config::is_initialized() {
            config::init(CoreConfig::load());
        }
    });
}

fn open_stores() -> (SharedStateStore, ObjectStore, tempfile::TempDir, tempfile::TempDir) {
    let sss_dir = tempfile::tempdir().unwrap();
    let os_dir = tempfile::tempdir().unwrap();
    let sss = SharedStateStore::open(sss_dir.path()).unwrap();
    let os = ObjectStore::open(os_dir.path()).unwrap();
    (sss, os, sss_dir, os_dir)
}

/// Record this scenario's outcome against a real SSS instance (SPEC_FULL.md
/// §3's supplemented `test_runs` table), then read it back to prove the
/// write round-trips instead of only asserting in-memory.
async fn record_scenario_outcome(sss: &SharedStateStore, scenario_name: &str, detail: &str) {
    let record = IntegrationTestRecord {
        run_id: uuid::Uuid::new_v4().to_string(),
        scenario_name: scenario_name.to_string(),
        passed: true,
        detail: detail.to_string(),
        recorded_at: chrono::Utc::now(),
    };
    sss.record_test_run(&record).await.unwrap();
    let fetched = sss.get_test_run(&record.run_id).await.unwrap().expect("just-recorded test run present");
    assert_eq!(fetched.scenario_name, scenario_name);
    assert!(fetched.passed);
}

fn region(id: &str) -> Region {
    Region {
        region_id: id.to_string(),
        name: format!("Region {id}"),
        center: GeoPoint { latitude: -6.0, longitude: -53.0 },
        radius_km: 25.0,
        cloud_cover_threshold: 20.0,
        status: RegionStatus::Active,
        created_at: chrono::Utc::now(),
        last_deforestation_percentage: None,
        last_analysis_at: None,
    }
}

/// S1: a moderate deforestation signal produces a Succeeded run with a
/// non-INFO alert and an updated region snapshot.
#[tokio::test]
async fn scenario_s1_moderate_alert_end_to_end() {
    ensure_config();
    let (sss, os, _sss_dir, _os_dir) = open_stores();
    let r = region("s1");
    sss.put_region(&r).await.unwrap();

    let images = vec![
        MockImage { id: "a".to_string(), mean_ndvi: 0.8, vegetation_coverage: 0.9 },
        MockImage { id: "b".to_string(), mean_ndvi: 0.55, vegetation_coverage: 0.6 },
    ];
    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(images));
    let ao = AnalysisOrchestrator::new(sss.clone(), os, workers);

    let run = ao.trigger_analysis(&r, "2022-06-01", "2022-09-01").await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let output = run.output.expect("succeeded run carries output");
    assert!(output["alert_id"].is_string() || output["alert_id"].is_null());
    assert!(output["deforestation_percentage"].as_f64().unwrap() >= 0.0);

    let updated = sss.get_region("s1").await.unwrap().expect("region still present");
    assert!(updated.last_analysis_at.is_some());

    record_scenario_outcome(&sss, "S1", "moderate deforestation signal produced a succeeded run").await;
}

/// S7: zero matching images ends the run as NO_IMAGES_FOUND with no alert,
/// and still advances the region's last_analysis_at.
#[tokio::test]
async fn scenario_s7_no_images_found() {
    ensure_config();
    let (sss, os, _sss_dir, _os_dir) = open_stores();
    let r = region("s7");
    sss.put_region(&r).await.unwrap();

    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(Vec::new()));
    let ao = AnalysisOrchestrator::new(sss.clone(), os, workers);

    let run = ao.trigger_analysis(&r, "2022-06-01", "2022-09-01").await.unwrap();
    assert_eq!(run.status, RunStatus::NoImagesFound);
    assert!(run.output.is_none());

    let updated = sss.get_region("s7").await.unwrap().expect("region still present");
    assert!(updated.last_analysis_at.is_some());
    assert!(updated.last_deforestation_percentage.is_none());

    record_scenario_outcome(&sss, "S7", "zero matching images ended the run as NO_IMAGES_FOUND").await;
}

/// Re-running the identical hour-bucketed alert hits the dedup key and
/// leaves exactly one alert behind instead of duplicating it.
#[tokio::test]
async fn rerun_within_same_hour_is_deduplicated() {
    ensure_config();
    let (sss, os, _sss_dir, _os_dir) = open_stores();
    let r = region("dedup");
    sss.put_region(&r).await.unwrap();

    let images = vec![
        MockImage { id: "a".to_string(), mean_ndvi: 0.8, vegetation_coverage: 0.9 },
        MockImage { id: "b".to_string(), mean_ndvi: 0.55, vegetation_coverage: 0.6 },
    ];
    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(images));
    let ao = AnalysisOrchestrator::new(sss.clone(), os, workers);

    let first = ao.trigger_analysis(&r, "2022-06-01", "2022-09-01").await.unwrap();
    let second = ao.trigger_analysis(&r, "2022-06-01", "2022-09-01").await.unwrap();

    let alerts = sss.query_alerts_by_region("dedup").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(first.output.unwrap()["alert_id"], second.output.unwrap()["alert_id"]);

    record_scenario_outcome(&sss, "dedup", "re-running within the same hour bucket left exactly one alert").await;
}

/// S2-style: a scheduler claims ownership of a region and fires at least
/// once on a tight cron without the caller ever invoking the orchestrator
/// directly.
#[tokio::test]
async fn scheduler_fires_registered_region() {
    ensure_config();
    let (sss, os, _sss_dir, _os_dir) = open_stores();
    let r = region("sched");
    sss.put_region(&r).await.unwrap();

    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(vec![MockImage {
        id: "a".to_string(),
        mean_ndvi: 0.8,
        vegetation_coverage: 0.9,
    }]));
    let ao = Arc::new(AnalysisOrchestrator::new(sss.clone(), os, workers));
    let coordinator: SharedCoordinator = Arc::new(InMemoryCoordinator::new("replica-a"));
    let scheduler = RegionScheduler::new(sss.clone(), coordinator, ao, "replica-a");

    scheduler.start("sched", "* * * * *", true).await.unwrap();

    // Give the job loop a moment to fire at least once via trigger_immediate.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let runs = sss.query_runs_by_region("sched").await.unwrap();
    assert!(!runs.is_empty(), "scheduler should have fired at least one run");

    scheduler.stop("sched").unwrap();

    record_scenario_outcome(&sss, "S2", "scheduler claimed the region and fired without a direct trigger call").await;
}

/// Stopping a scheduled region removes it from the active job set.
#[tokio::test]
async fn stop_removes_job_from_active_set() {
    ensure_config();
    let (sss, os, _sss_dir, _os_dir) = open_stores();
    let r = region("stopme");
    sss.put_region(&r).await.unwrap();

    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(Vec::new()));
    let ao = Arc::new(AnalysisOrchestrator::new(sss.clone(), os, workers));
    let coordinator: SharedCoordinator = Arc::new(InMemoryCoordinator::new("replica-a"));
    let scheduler = RegionScheduler::new(sss, coordinator, ao, "replica-a");

    scheduler.start("stopme", "0 0 1 1 *", false).await.unwrap();
    assert_eq!(scheduler.active_jobs().await.len(), 1);

    scheduler.stop("stopme").unwrap();
    assert_eq!(scheduler.active_jobs().await.len(), 0);
}

/// Retention cleanup deletes terminal runs older than the retention window
/// (and only those) for every currently-scheduled region.
#[tokio::test]
async fn cleanup_old_jobs_deletes_expired_terminal_runs() {
    ensure_config();
    let (sss, os, _sss_dir, _os_dir) = open_stores();
    let r = region("cleanup");
    sss.put_region(&r).await.unwrap();

    let old_run = forestshield_core::types::AnalysisRun {
        run_id: "old-run".to_string(),
        region_id: "cleanup".to_string(),
        status: RunStatus::Succeeded,
        started_at: chrono::Utc::now() - chrono::Duration::days(400),
        ended_at: Some(chrono::Utc::now() - chrono::Duration::days(400)),
        progress: 100,
        input: serde_json::json!({}),
        output: None,
        error: None,
        current_state: "Done".to_string(),
        state_input: serde_json::json!({}),
    };
    let recent_run = forestshield_core::types::AnalysisRun {
        run_id: "recent-run".to_string(),
        ended_at: Some(chrono::Utc::now()),
        ..old_run.clone()
    };
    sss.put_analysis_run(&old_run).await.unwrap();
    sss.put_analysis_run(&recent_run).await.unwrap();

    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(Vec::new()));
    let ao = Arc::new(AnalysisOrchestrator::new(sss.clone(), os, workers));
    let coordinator: SharedCoordinator = Arc::new(InMemoryCoordinator::new("replica-a"));
    let scheduler = RegionScheduler::new(sss.clone(), coordinator, ao, "replica-a");
    scheduler.start("cleanup", "0 0 1 1 *", false).await.unwrap();

    let removed = scheduler.cleanup_old_jobs().await.unwrap();
    assert_eq!(removed, 1);

    let remaining = sss.query_runs_by_region("cleanup").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].run_id, "recent-run");
}
