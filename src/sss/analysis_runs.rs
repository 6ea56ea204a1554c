use super::{SharedStateStore, SssError};
use crate::types::{AnalysisRun, RunStatus};
use chrono::Utc;

const TREE: &str = "analysis_runs";
const BY_REGION_TREE: &str = "analysis_runs_by_region";
const BY_STATUS_TREE: &str = "analysis_runs_by_status";

fn region_index_key(region_id: &str, run_id: &str) -> Vec<u8> {
    let mut key = region_id.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(run_id.as_bytes());
    key
}

fn status_index_key(status: RunStatus, run_id: &str) -> Vec<u8> {
    let mut key = format!("{status:?}").into_bytes();
    key.push(0);
    key.extend_from_slice(run_id.as_bytes());
    key
}

impl SharedStateStore {
    /// `put(table=analysis_runs, item)` — also the orchestrator's durable
    /// checkpoint write: "before entering state S with input X, record
    /// (run_id, state=S, input=X)" (spec §4.5).
    pub async fn put_analysis_run(&self, run: &AnalysisRun) -> Result<(), SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let by_region = self.db.open_tree(BY_REGION_TREE)?;
        let by_status = self.db.open_tree(BY_STATUS_TREE)?;

        // Drop stale status-index entries for this run (a run's status can
        // change many times before reaching a terminal state).
        for item in by_status.iter() {
            let (k, _v) = item?;
            if let Some(pos) = k.iter().position(|b| *b == 0) {
                if &k[pos + 1..] == run.run_id.as_bytes() {
                    by_status.remove(k)?;
                }
            }
        }

        let bytes = serde_json::to_vec(run)?;
        tree.insert(run.run_id.as_bytes(), bytes)?;
        by_region.insert(region_index_key(&run.region_id, &run.run_id), run.run_id.as_bytes())?;
        by_status.insert(status_index_key(run.status, &run.run_id), run.run_id.as_bytes())?;
        Ok(())
    }

    pub async fn get_analysis_run(&self, run_id: &str) -> Result<Option<AnalysisRun>, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        match tree.get(run_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn query_runs_by_region(&self, region_id: &str) -> Result<Vec<AnalysisRun>, SssError> {
        let _permit = self.permit().await;
        let idx = self.db.open_tree(BY_REGION_TREE)?;
        let tree = self.db.open_tree(TREE)?;
        let mut prefix = region_id.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for item in idx.scan_prefix(&prefix) {
            let (_k, run_id) = item?;
            if let Some(bytes) = tree.get(&run_id)? {
                out.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(out)
    }

    /// `query(table=analysis_runs, index=status, ...)` — used by crash
    /// recovery to find `IN_PROGRESS` runs to resume (spec §4.5).
    pub async fn query_runs_by_status(&self, status: RunStatus) -> Result<Vec<AnalysisRun>, SssError> {
        let _permit = self.permit().await;
        let idx = self.db.open_tree(BY_STATUS_TREE)?;
        let tree = self.db.open_tree(TREE)?;
        let mut prefix = format!("{status:?}").into_bytes();
        prefix.push(0);
        let mut out = Vec::new();
        for item in idx.scan_prefix(&prefix) {
            let (_k, run_id) = item?;
            if let Some(bytes) = tree.get(&run_id)? {
                out.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(out)
    }

    /// Transition a run's status, enforcing "no back-edges from terminal
    /// states" (spec §3 invariant) and setting `ended_at` iff terminal.
    pub async fn transition_run_status(
        &self,
        run_id: &str,
        new_status: RunStatus,
        current_state: &str,
        error: Option<String>,
    ) -> Result<AnalysisRun, SssError> {
        let mut run = self
            .get_analysis_run(run_id)
            .await?
            .ok_or(SssError::NotFound)?;

        if run.status.is_terminal() {
            return Err(SssError::ConditionFailed);
        }

        run.status = new_status;
        run.current_state = current_state.to_string();
        run.error = error;
        if new_status.is_terminal() {
            run.ended_at = Some(Utc::now());
        }

        self.put_analysis_run(&run).await?;
        Ok(run)
    }

    /// `delete(table=analysis_runs, run_id)` — drops the row plus its
    /// region/status index entries. Used by retention cleanup (spec §4.6);
    /// a no-op (returns `false`) if the run is already gone.
    pub async fn delete_analysis_run(&self, run_id: &str) -> Result<bool, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;

        let Some(bytes) = tree.get(run_id.as_bytes())? else {
            return Ok(false);
        };
        let run: AnalysisRun = serde_json::from_slice(&bytes)?;

        let by_region = self.db.open_tree(BY_REGION_TREE)?;
        let by_status = self.db.open_tree(BY_STATUS_TREE)?;
        by_region.remove(region_index_key(&run.region_id, run_id))?;
        by_status.remove(status_index_key(run.status, run_id))?;
        tree.remove(run_id.as_bytes())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn run(id: &str, region: &str, status: RunStatus) -> AnalysisRun {
        AnalysisRun {
            run_id: id.to_string(),
            region_id: region.to_string(),
            status,
            started_at: Utc::now(),
            ended_at: None,
            progress: 0,
            input: serde_json::json!({}),
            output: None,
            error: None,
            current_state: "SearchImages".to_string(),
            state_input: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn terminal_has_ended_at() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_analysis_run(&run("run1", "r1", RunStatus::InProgress)).await.unwrap();
        let updated = store
            .transition_run_status("run1", RunStatus::Succeeded, "Done", None)
            .await
            .unwrap();
        assert!(updated.ended_at.is_some());
    }

    #[tokio::test]
    async fn no_transition_from_terminal() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_analysis_run(&run("run1", "r1", RunStatus::Succeeded)).await.unwrap();
        let mut succeeded = store.get_analysis_run("run1").await.unwrap().unwrap();
        succeeded.ended_at = Some(Utc::now());
        store.put_analysis_run(&succeeded).await.unwrap();

        let err = store
            .transition_run_status("run1", RunStatus::Failed, "Failed", None)
            .await
            .unwrap_err();
        matches!(err, SssError::ConditionFailed);
    }

    #[tokio::test]
    async fn query_by_status_finds_in_progress() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_analysis_run(&run("run1", "r1", RunStatus::InProgress)).await.unwrap();
        store.put_analysis_run(&run("run2", "r1", RunStatus::Succeeded)).await.unwrap();

        let in_progress = store.query_runs_by_status(RunStatus::InProgress).await.unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].run_id, "run1");
    }

    #[tokio::test]
    async fn query_by_region() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_analysis_run(&run("run1", "r1", RunStatus::InProgress)).await.unwrap();
        store.put_analysis_run(&run("run2", "r2", RunStatus::InProgress)).await.unwrap();

        let runs = store.query_runs_by_region("r1").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "run1");
    }

    #[tokio::test]
    async fn delete_removes_row_and_indices() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_analysis_run(&run("run1", "r1", RunStatus::Succeeded)).await.unwrap();

        assert!(store.delete_analysis_run("run1").await.unwrap());
        assert!(store.get_analysis_run("run1").await.unwrap().is_none());
        assert!(store.query_runs_by_region("r1").await.unwrap().is_empty());
        assert!(store.query_runs_by_status(RunStatus::Succeeded).await.unwrap().is_empty());
        assert!(!store.delete_analysis_run("run1").await.unwrap());
    }
}
