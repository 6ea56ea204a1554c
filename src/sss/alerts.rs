use super::{SharedStateStore, SssError};
use crate::types::Alert;

const TREE: &str = "alerts";
const BY_REGION_TREE: &str = "alerts_by_region";

/// Secondary-index key: `{region_id}\0{inverted_ts}\0{alert_id}` so a forward
/// scan over the region's prefix yields newest-first order.
fn index_key(region_id: &str, timestamp_millis: i64, alert_id: &str) -> Vec<u8> {
    let inverted = i64::MAX - timestamp_millis;
    let mut key = Vec::with_capacity(region_id.len() + 1 + 8 + 1 + alert_id.len());
    key.extend_from_slice(region_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&inverted.to_be_bytes());
    key.push(0);
    key.extend_from_slice(alert_id.as_bytes());
    key
}

impl SharedStateStore {
    /// `put(table=alerts, item)` — unconditional upsert.
    pub async fn put_alert(&self, alert: &Alert) -> Result<(), SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let idx = self.db.open_tree(BY_REGION_TREE)?;
        let bytes = serde_json::to_vec(alert)?;
        tree.insert(alert.alert_id.as_bytes(), bytes)?;
        idx.insert(
            index_key(&alert.region_id, alert.timestamp.timestamp_millis(), &alert.alert_id),
            alert.alert_id.as_bytes(),
        )?;
        Ok(())
    }

    /// Conditional put keyed on the dedup key from spec §4.7 step 5: succeeds
    /// only if no alert with this `dedup_key` has been written yet. Returns
    /// `Ok(false)` (not an error) when a duplicate is suppressed, so retries
    /// at the top-level state are a deliberate, logged no-op rather than a
    /// propagated failure.
    pub async fn put_alert_deduplicated(&self, alert: &Alert) -> Result<bool, SssError> {
        let _permit = self.permit().await;
        let dedup_tree = self.db.open_tree("alerts_dedup")?;
        let inserted = dedup_tree
            .compare_and_swap(alert.dedup_key.as_bytes(), None as Option<&[u8]>, Some(alert.alert_id.as_bytes()))?
            .is_ok();

        if !inserted {
            return Ok(false);
        }

        let tree = self.db.open_tree(TREE)?;
        let idx = self.db.open_tree(BY_REGION_TREE)?;
        let bytes = serde_json::to_vec(alert)?;
        tree.insert(alert.alert_id.as_bytes(), bytes)?;
        idx.insert(
            index_key(&alert.region_id, alert.timestamp.timestamp_millis(), &alert.alert_id),
            alert.alert_id.as_bytes(),
        )?;
        Ok(true)
    }

    /// `get(table=alerts, key)`.
    pub async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        match tree.get(alert_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// `query(table=alerts, index=region_id, key_expression)` — newest first.
    pub async fn query_alerts_by_region(&self, region_id: &str) -> Result<Vec<Alert>, SssError> {
        let _permit = self.permit().await;
        let idx = self.db.open_tree(BY_REGION_TREE)?;
        let tree = self.db.open_tree(TREE)?;
        let mut prefix = region_id.as_bytes().to_vec();
        prefix.push(0);

        let mut out = Vec::new();
        for item in idx.scan_prefix(&prefix) {
            let (_k, alert_id) = item?;
            if let Some(bytes) = tree.get(&alert_id)? {
                out.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(out)
    }

    /// `update(table=alerts, key, mutation)` — used for acknowledgement.
    /// Enforces the monotonic `acknowledged: false -> true` invariant
    /// (spec §3): acknowledging an already-acknowledged alert is a no-op,
    /// never un-acknowledges.
    pub async fn acknowledge_alert(&self, alert_id: &str) -> Result<Alert, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let current = tree.get(alert_id.as_bytes())?.ok_or(SssError::NotFound)?;
        let mut alert: Alert = serde_json::from_slice(&current)?;
        alert.acknowledged = true;
        let bytes = serde_json::to_vec(&alert)?;
        tree.insert(alert_id.as_bytes(), bytes)?;
        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertLevel;
    use chrono::{Duration, Utc};

    fn alert(id: &str, region: &str, ts_offset_secs: i64) -> Alert {
        let timestamp = Utc::now() + Duration::seconds(ts_offset_secs);
        Alert {
            alert_id: id.to_string(),
            region_id: region.to_string(),
            region_name: "Amazon North".to_string(),
            level: AlertLevel::Moderate,
            deforestation_percentage: 7.0,
            confidence_score: 0.8,
            message: "test".to_string(),
            acknowledged: false,
            timestamp,
            dedup_key: format!("{region}-{}", timestamp.timestamp() / 3600),
        }
    }

    #[tokio::test]
    async fn newest_first_ordering() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_alert(&alert("a1", "r1", 0)).await.unwrap();
        store.put_alert(&alert("a2", "r1", 100)).await.unwrap();
        store.put_alert(&alert("a3", "r1", 50)).await.unwrap();

        let alerts = store.query_alerts_by_region("r1").await.unwrap();
        assert_eq!(alerts.iter().map(|a| a.alert_id.clone()).collect::<Vec<_>>(), vec!["a2", "a3", "a1"]);
    }

    #[tokio::test]
    async fn dedup_rejects_same_key() {
        let (store, _dir) = SharedStateStore::open_temp();
        let mut a1 = alert("a1", "r1", 0);
        a1.dedup_key = "r1-100".to_string();
        let mut a2 = alert("a2", "r1", 1);
        a2.dedup_key = "r1-100".to_string();

        assert!(store.put_alert_deduplicated(&a1).await.unwrap());
        assert!(!store.put_alert_deduplicated(&a2).await.unwrap());
        assert_eq!(store.query_alerts_by_region("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_is_monotonic() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_alert(&alert("a1", "r1", 0)).await.unwrap();
        let acked = store.acknowledge_alert("a1").await.unwrap();
        assert!(acked.acknowledged);
        let acked_again = store.acknowledge_alert("a1").await.unwrap();
        assert!(acked_again.acknowledged);
    }
}
