//! ForestShield CLI entrypoint.
//!
//! # Usage
//!
//! ```bash
//! # Register a region and run one analysis pass against the in-process mock workers
//! ./forestshield trigger --region-id amazon-01 --name "Amazon Block 1" \
//!     --lat -6.0 --lon -53.0 --radius-km 25 --start 2022-06-01 --end 2022-09-01
//!
//! # Register a region and let the scheduler fire it on a cron
//! ./forestshield schedule --region-id amazon-01 --name "Amazon Block 1" \
//!     --lat -6.0 --lon -53.0 --radius-km 25 --cron "0 */6 * * *"
//! ```
//!
//! # Environment Variables
//!
//! - `FORESTSHIELD_CONFIG`: path to a TOML config file overriding defaults.
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forestshield_core::ao::AnalysisOrchestrator;
use forestshield_core::config::{self, CoreConfig};
use forestshield_core::coordinator::{InMemoryCoordinator, SharedCoordinator};
use forestshield_core::objstore::ObjectStore;
use forestshield_core::scheduler::RegionScheduler;
use forestshield_core::sss::SharedStateStore;
use forestshield_core::types::{GeoPoint, Region, RegionStatus, RunStatus};
use forestshield_core::workers::mock::{MockImage, MockWorkers};
use forestshield_core::workers::Workers;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DATA_DIR: &str = "./data";

#[derive(Parser, Debug)]
#[command(name = "forestshield")]
#[command(about = "ForestShield deforestation monitoring system")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register (or update) a region and run one analysis pass immediately.
    Trigger(RegionArgs),
    /// Register (or update) a region and let the scheduler fire it on a cron
    /// expression until interrupted with Ctrl+C.
    Schedule {
        #[command(flatten)]
        region: RegionArgs,
        /// Standard 5-field cron expression, e.g. "0 */6 * * *"
        #[arg(long)]
        cron: String,
        /// Fire once immediately, in addition to the cron schedule.
        #[arg(long)]
        trigger_immediate: bool,
    },
}

#[derive(Parser, Debug, Clone)]
struct RegionArgs {
    #[arg(long)]
    region_id: String,
    #[arg(long)]
    name: String,
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    #[arg(long, default_value = "10.0")]
    radius_km: f64,
    #[arg(long, default_value = "20.0")]
    cloud_cover_threshold: f64,
    /// Satellite search window start date (YYYY-MM-DD), only used by `trigger`.
    #[arg(long, default_value = "2022-06-01")]
    start: String,
    /// Satellite search window end date (YYYY-MM-DD), only used by `trigger`.
    #[arg(long, default_value = "2022-09-01")]
    end: String,
}

/// Build the demo satellite scene the mock worker fleet hands back: one
/// heavily-vegetated pass and one degraded pass, enough to exercise the
/// orchestrator's per-image fan-out without a real STAC backend.
fn demo_images() -> Vec<MockImage> {
    vec![
        MockImage { id: "scene-a".to_string(), mean_ndvi: 0.82, vegetation_coverage: 0.93 },
        MockImage { id: "scene-b".to_string(), mean_ndvi: 0.61, vegetation_coverage: 0.70 },
    ]
}

fn open_region(region: &RegionArgs) -> Result<Region> {
    let r = Region {
        region_id: region.region_id.clone(),
        name: region.name.clone(),
        center: GeoPoint { latitude: region.lat, longitude: region.lon },
        radius_km: region.radius_km,
        cloud_cover_threshold: region.cloud_cover_threshold,
        status: RegionStatus::Active,
        created_at: chrono::Utc::now(),
        last_deforestation_percentage: None,
        last_analysis_at: None,
    };
    r.validate().map_err(|e| anyhow::anyhow!("invalid region: {e}"))?;
    Ok(r)
}

async fn run_trigger(sss: SharedStateStore, os: ObjectStore, region_args: RegionArgs) -> Result<i32> {
    let region = match open_region(&region_args) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            return Ok(1);
        }
    };

    sss.put_region(&region).await.context("failed to persist region")?;

    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(demo_images()));
    let ao = AnalysisOrchestrator::new(sss, os, workers);

    info!(region_id = %region.region_id, "triggering analysis run");
    match ao.trigger_analysis(&region, &region_args.start, &region_args.end).await {
        Ok(run) => {
            info!(run_id = %run.run_id, status = ?run.status, output = ?run.output, "analysis run finished");
            match run.status {
                RunStatus::Succeeded | RunStatus::NoImagesFound => Ok(0),
                _ => Ok(2),
            }
        }
        Err(e) => {
            error!("analysis run failed: {e}");
            Ok(2)
        }
    }
}

async fn run_schedule(
    sss: SharedStateStore,
    os: ObjectStore,
    region_args: RegionArgs,
    cron: String,
    trigger_immediate: bool,
    cancel: CancellationToken,
) -> Result<i32> {
    let region = match open_region(&region_args) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            return Ok(1);
        }
    };
    sss.put_region(&region).await.context("failed to persist region")?;

    let workers: Arc<dyn Workers> = Arc::new(MockWorkers::new(demo_images()));
    let ao = Arc::new(AnalysisOrchestrator::new(sss.clone(), os, workers));
    let coordinator: SharedCoordinator = Arc::new(InMemoryCoordinator::new("cli-replica"));
    let scheduler = Arc::new(RegionScheduler::new(sss, coordinator, ao, "cli-replica"));

    if let Err(e) = scheduler.start(&region.region_id, &cron, trigger_immediate).await {
        error!("failed to schedule region: {e}");
        return Ok(1);
    }
    info!(region_id = %region.region_id, cron = %cron, "scheduler started, waiting for Ctrl+C");

    cancel.cancelled().await;
    info!("shutdown signal received, stopping scheduled job");
    let _ = scheduler.stop(&region.region_id);
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    config::init(CoreConfig::load());

    let args = CliArgs::parse();

    std::fs::create_dir_all(DATA_DIR).context("failed to create data directory")?;
    let sss = match SharedStateStore::open(format!("{DATA_DIR}/sss.sled")) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to open shared state store: {e}");
            std::process::exit(2);
        }
    };
    let os = match ObjectStore::open(format!("{DATA_DIR}/objects")) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to open object store: {e}");
            std::process::exit(2);
        }
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("received Ctrl+C, shutting down");
        shutdown.cancel();
    });

    let code = match args.command {
        Command::Trigger(region_args) => run_trigger(sss, os, region_args).await?,
        Command::Schedule { region, cron, trigger_immediate } => {
            run_schedule(sss, os, region, cron, trigger_immediate, cancel).await?
        }
    };

    std::process::exit(code);
}
