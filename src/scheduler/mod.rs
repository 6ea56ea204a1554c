//! Region Scheduler (RS) — spec.md §4.6.
//!
//! One cooperative timer per owned region, grounded in the teacher's
//! `background::self_healer` driver loop (`loop { sleep(interval).await;
//! run_cycle().await }`) and `fleet::uploader`'s "retry whole batch next
//! tick" failure handling. Ownership is arbitrated through the
//! [`crate::coordinator::Coordinator`] claim table so exactly one replica
//! fires a given region's cron at a time.

use crate::ao::AnalysisOrchestrator;
use crate::coordinator::SharedCoordinator;
use crate::error::{ErrorKind, KindedError};
use crate::sss::{SharedStateStore, SssError};
use crate::types::RunStatus;
use chrono::{DateTime, Utc};
use croner::Cron;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),
    #[error("region {0} has no scheduled job")]
    NotScheduled(String),
    #[error("shared state store error: {0}")]
    Sss(#[from] SssError),
}

impl KindedError for SchedulerError {
    fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidCron(..) => ErrorKind::Validation,
            SchedulerError::NotScheduled(_) => ErrorKind::NotFound,
            SchedulerError::Sss(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// One region's registration: the parsed cron, its firing-loop cancellation
/// handle, and the bookkeeping `active_jobs()` reports.
struct Job {
    cron_expression: String,
    next_fire_at: Mutex<Option<DateTime<Utc>>>,
    last_fired_at: Mutex<Option<DateTime<Utc>>>,
    is_running: AtomicBool,
    cancel: CancellationToken,
}

pub struct RegionScheduler {
    sss: SharedStateStore,
    coordinator: SharedCoordinator,
    ao: Arc<AnalysisOrchestrator>,
    replica_id: String,
    jobs: DashMap<String, Arc<Job>>,
    paused: Arc<AtomicBool>,
    fire_permits: Arc<Semaphore>,
    waiting: Arc<AtomicU64>,
    active: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    delayed: Arc<AtomicU64>,
}

impl RegionScheduler {
    pub fn new(
        sss: SharedStateStore,
        coordinator: SharedCoordinator,
        ao: Arc<AnalysisOrchestrator>,
        replica_id: impl Into<String>,
    ) -> Self {
        let queue_workers = crate::config::get().scheduler.queue_workers;
        Self {
            sss,
            coordinator,
            ao,
            replica_id: replica_id.into(),
            jobs: DashMap::new(),
            paused: Arc::new(AtomicBool::new(false)),
            fire_permits: Arc::new(Semaphore::new(queue_workers)),
            waiting: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            delayed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn claim_key(region_id: &str) -> String {
        format!("scheduler:{region_id}")
    }

    /// `start(region_id, cron_expression, params, trigger_immediate?)`.
    /// Validates the cron up front — an unparseable expression is rejected
    /// before any ownership attempt (spec §4.6). Registers the job whether
    /// or not ownership is won: an unclaimed schedule stays recorded with no
    /// firing, ready to pick up the claim once the TTL lapses elsewhere.
    pub async fn start(
        &self,
        region_id: &str,
        cron_expression: &str,
        trigger_immediate: bool,
    ) -> Result<(), SchedulerError> {
        let parsed = Cron::new(cron_expression)
            .parse()
            .map_err(|e| SchedulerError::InvalidCron(cron_expression.to_string(), e.to_string()))?;

        if let Some(existing) = self.jobs.get(region_id) {
            existing.cancel.cancel();
        }

        let job = Arc::new(Job {
            cron_expression: cron_expression.to_string(),
            next_fire_at: Mutex::new(parsed.find_next_occurrence(&Utc::now(), false).ok()),
            last_fired_at: Mutex::new(None),
            is_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        self.jobs.insert(region_id.to_string(), job.clone());

        let region_id = region_id.to_string();
        let sss = self.sss.clone();
        let coordinator = self.coordinator.clone();
        let ao = self.ao.clone();
        let replica_id = self.replica_id.clone();
        let paused = self.paused.clone();
        let fire_permits = self.fire_permits.clone();
        let waiting = self.waiting.clone();
        let active = self.active.clone();
        let completed = self.completed.clone();
        let failed = self.failed.clone();
        let delayed = self.delayed.clone();

        tokio::spawn(run_job_loop(JobLoopArgs {
            region_id,
            cron_expression: cron_expression.to_string(),
            job,
            sss,
            coordinator,
            ao,
            replica_id,
            paused,
            fire_permits,
            waiting,
            active,
            completed,
            failed,
            delayed,
            trigger_immediate,
        }));

        Ok(())
    }

    /// `stop(region_id)` — cancels the firing timer immediately. In-flight
    /// analysis runs already handed to the AO run to completion (spec §5).
    pub fn stop(&self, region_id: &str) -> Result<(), SchedulerError> {
        let job = self.jobs.remove(region_id).ok_or_else(|| SchedulerError::NotScheduled(region_id.to_string()))?;
        job.1.cancel.cancel();
        Ok(())
    }

    /// `pause_all()` — stops firings but preserves DC ownership claims, so
    /// `resume_all()` resumes instantly without re-claiming.
    pub fn pause_all(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_all(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// `active_jobs() -> [(region_id, is_running, next_fire_at)]`.
    pub async fn active_jobs(&self) -> Vec<(String, bool, Option<DateTime<Utc>>)> {
        let mut out = Vec::new();
        for entry in self.jobs.iter() {
            let next_fire_at = *entry.value().next_fire_at.lock().await;
            out.push((entry.key().clone(), entry.value().is_running.load(Ordering::SeqCst), next_fire_at));
        }
        out
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.waiting.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
        }
    }

    /// `cleanup_old_jobs()` — drops terminal `AnalysisRun` records older
    /// than the retention window (spec §4.6 supplemented housekeeping op).
    pub async fn cleanup_old_jobs(&self) -> Result<usize, SchedulerError> {
        let retention = chrono::Duration::seconds(crate::config::get().scheduler.retention_window_secs);
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        for region_id in self.jobs.iter().map(|e| e.key().clone()).collect::<Vec<_>>() {
            let runs = self.sss.query_runs_by_region(&region_id).await?;
            for run in runs {
                if run.status.is_terminal() && run.ended_at.map(|t| t < cutoff).unwrap_or(false) {
                    if self.sss.delete_analysis_run(&run.run_id).await? {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

struct JobLoopArgs {
    region_id: String,
    cron_expression: String,
    job: Arc<Job>,
    sss: SharedStateStore,
    coordinator: SharedCoordinator,
    ao: Arc<AnalysisOrchestrator>,
    replica_id: String,
    paused: Arc<AtomicBool>,
    fire_permits: Arc<Semaphore>,
    waiting: Arc<AtomicU64>,
    active: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    delayed: Arc<AtomicU64>,
    trigger_immediate: bool,
}

/// One region's firing loop: claim ownership, refresh it at `TTL/2`, and
/// fire whenever the cron's next occurrence arrives. Refresh failure stops
/// firing immediately — the region is marked not-running until another
/// `claim` succeeds (spec §4.6).
async fn run_job_loop(args: JobLoopArgs) {
    let JobLoopArgs {
        region_id,
        cron_expression,
        job,
        sss,
        coordinator,
        ao,
        replica_id,
        paused,
        fire_permits,
        waiting,
        active,
        completed,
        failed,
        delayed,
        mut trigger_immediate,
    } = args;

    let parsed = match Cron::new(&cron_expression).parse() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(region_id = %region_id, error = %e, "cron re-parse failed in job loop");
            return;
        }
    };

    let ttl = Duration::from_secs(crate::config::get().scheduler.claim_ttl_secs);
    let claim_key = RegionScheduler::claim_key(&region_id);

    loop {
        if job.cancel.is_cancelled() {
            job.is_running.store(false, Ordering::SeqCst);
            coordinator.release(&claim_key).await;
            return;
        }

        if !coordinator.claim(&claim_key, ttl).await {
            job.is_running.store(false, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(ttl / 2) => continue,
                _ = job.cancel.cancelled() => return,
            }
        }
        job.is_running.store(true, Ordering::SeqCst);
        tracing::info!(region_id = %region_id, replica_id = %replica_id, cron = %job.cron_expression, "claimed scheduler ownership");

        'owned: loop {
            let refresh_interval = ttl / 2;
            let next_fire = if trigger_immediate {
                trigger_immediate = false;
                Some(Utc::now())
            } else {
                parsed.find_next_occurrence(&Utc::now(), false).ok()
            };
            *job.next_fire_at.lock().await = next_fire;

            let Some(fire_at) = next_fire else {
                tracing::error!(region_id = %region_id, "cron produced no next occurrence — stopping job");
                job.is_running.store(false, Ordering::SeqCst);
                return;
            };

            let now = Utc::now();
            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait.min(refresh_interval)) => {}
                _ = job.cancel.cancelled() => {
                    job.is_running.store(false, Ordering::SeqCst);
                    coordinator.release(&claim_key).await;
                    return;
                }
            }

            if Utc::now() < fire_at {
                // Woke up for a refresh tick, not a firing. Refresh and loop.
                if !coordinator.refresh(&claim_key, ttl).await {
                    tracing::warn!(region_id = %region_id, "lost scheduler ownership — stopping firer");
                    job.is_running.store(false, Ordering::SeqCst);
                    break 'owned;
                }
                continue;
            }

            if !coordinator.refresh(&claim_key, ttl).await {
                tracing::warn!(region_id = %region_id, "lost scheduler ownership at firing time — skipping");
                job.is_running.store(false, Ordering::SeqCst);
                break 'owned;
            }

            if paused.load(Ordering::SeqCst) {
                delayed.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            // In-progress-skip rule: never pile firings up behind a slow run.
            match sss.query_runs_by_region(&region_id).await {
                Ok(runs) if runs.iter().any(|r| !r.status.is_terminal()) => {
                    tracing::info!(region_id = %region_id, "skipping firing: a run is already in progress");
                    delayed.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(region_id = %region_id, error = %e, "failed to check in-progress runs — skipping this firing");
                    delayed.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                Ok(_) => {}
            }

            *job.last_fired_at.lock().await = Some(fire_at);
            waiting.fetch_add(1, Ordering::SeqCst);

            let Some(region) = sss.get_region(&region_id).await.ok().flatten() else {
                tracing::warn!(region_id = %region_id, "region no longer exists — stopping firer");
                job.is_running.store(false, Ordering::SeqCst);
                return;
            };

            let permit = fire_permits.clone().acquire_owned().await.expect("semaphore closed");
            waiting.fetch_sub(1, Ordering::SeqCst);
            active.fetch_add(1, Ordering::SeqCst);

            let ao = ao.clone();
            let completed = completed.clone();
            let failed = failed.clone();
            let active_counter = active.clone();
            let now_str = Utc::now();
            let start_date = (now_str - chrono::Duration::days(90)).to_rfc3339();
            let end_date = now_str.to_rfc3339();

            tokio::spawn(async move {
                let _permit = permit;
                match ao.trigger_analysis(&region, &start_date, &end_date).await {
                    Ok(run) if run.status == RunStatus::Succeeded || run.status == RunStatus::NoImagesFound => {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(_) | Err(_) => {
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
                active_counter.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}
