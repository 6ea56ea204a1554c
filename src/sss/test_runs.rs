use super::{SharedStateStore, SssError};
use crate::types::IntegrationTestRecord;

const TREE: &str = "test_runs";

impl SharedStateStore {
    /// Record an end-to-end scenario's outcome (supplemented entity, see
    /// SPEC_FULL.md §3). Used by the S1-S7 scenario tests to assert against
    /// a real SSS instance instead of mocking it away.
    pub async fn record_test_run(&self, record: &IntegrationTestRecord) -> Result<(), SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let bytes = serde_json::to_vec(record)?;
        tree.insert(record.run_id.as_bytes(), bytes)?;
        Ok(())
    }

    pub async fn get_test_run(&self, run_id: &str) -> Result<Option<IntegrationTestRecord>, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        match tree.get(run_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
