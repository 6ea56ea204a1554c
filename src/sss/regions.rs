use super::{SharedStateStore, SssError};
use crate::types::Region;

const TREE: &str = "regions";

impl SharedStateStore {
    /// `put(table=regions, item)` — unconditional upsert keyed on `region_id`.
    pub async fn put_region(&self, region: &Region) -> Result<(), SssError> {
        region.validate().map_err(SssError::Validation)?;
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let bytes = serde_json::to_vec(region)?;
        tree.insert(region.region_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// `get(table=regions, key)`.
    pub async fn get_region(&self, region_id: &str) -> Result<Option<Region>, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        match tree.get(region_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// `delete(table=regions, key)`.
    pub async fn delete_region(&self, region_id: &str) -> Result<(), SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        tree.remove(region_id.as_bytes())?;
        Ok(())
    }

    /// `scan(table=regions, predicate?)`.
    pub async fn scan_regions(&self, predicate: impl Fn(&Region) -> bool) -> Result<Vec<Region>, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (_k, v) = item?;
            let region: Region = serde_json::from_slice(&v)?;
            if predicate(&region) {
                out.push(region);
            }
        }
        Ok(out)
    }

    /// `update(table=regions, key, mutation)` — applies `mutation` to the
    /// current item (or errors `NotFound`) and writes the result back
    /// unconditionally. Region updates have no caller-specified precondition
    /// in spec.md §3, unlike the MLM `latest`-pointer flip.
    pub async fn update_region(
        &self,
        region_id: &str,
        mutation: impl FnOnce(&mut Region),
    ) -> Result<Region, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let current = tree
            .get(region_id.as_bytes())?
            .ok_or(SssError::NotFound)?;
        let mut region: Region = serde_json::from_slice(&current)?;
        mutation(&mut region);
        let bytes = serde_json::to_vec(&region)?;
        tree.insert(region_id.as_bytes(), bytes)?;
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoPoint, RegionStatus};
    use chrono::Utc;

    fn region(id: &str) -> Region {
        Region {
            region_id: id.to_string(),
            name: "Amazon North".to_string(),
            center: GeoPoint { latitude: -6.0, longitude: -53.0 },
            radius_km: 10.0,
            cloud_cover_threshold: 20.0,
            status: RegionStatus::Active,
            created_at: Utc::now(),
            last_deforestation_percentage: None,
            last_analysis_at: None,
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_region(&region("r1")).await.unwrap();
        let got = store.get_region("r1").await.unwrap().unwrap();
        assert_eq!(got.region_id, "r1");
    }

    #[tokio::test]
    async fn rejects_invalid_latitude() {
        let (store, _dir) = SharedStateStore::open_temp();
        let mut r = region("r1");
        r.center.latitude = 200.0;
        let err = store.put_region(&r).await.unwrap_err();
        assert_eq!(err.to_string().contains("latitude"), true);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let (store, _dir) = SharedStateStore::open_temp();
        let err = store.update_region("missing", |_| {}).await.unwrap_err();
        matches!(err, SssError::NotFound);
    }

    #[tokio::test]
    async fn status_transition_active_paused() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_region(&region("r1")).await.unwrap();
        let updated = store
            .update_region("r1", |r| r.status = RegionStatus::Paused)
            .await
            .unwrap();
        assert_eq!(updated.status, RegionStatus::Paused);
    }

    #[tokio::test]
    async fn scan_with_predicate() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.put_region(&region("r1")).await.unwrap();
        store.put_region(&region("r2")).await.unwrap();
        store
            .update_region("r2", |r| r.status = RegionStatus::Paused)
            .await
            .unwrap();

        let active = store
            .scan_regions(|r| r.status == RegionStatus::Active)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].region_id, "r1");
    }
}
