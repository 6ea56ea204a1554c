use super::{SharedStateStore, SssError};

const TREE: &str = "model_pointers";

fn pointer_key(tile_id: &str, region_tag: &str) -> Vec<u8> {
    let mut key = tile_id.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(region_tag.as_bytes());
    key
}

impl SharedStateStore {
    /// Read the current `latest` version string for `(tile_id, region_tag)`.
    pub async fn get_latest_pointer(&self, tile_id: &str, region_tag: &str) -> Result<Option<String>, SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        match tree.get(pointer_key(tile_id, region_tag))? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).to_string())),
            None => Ok(None),
        }
    }

    /// Atomically flip the `latest` pointer, guarded on the previous value
    /// equaling `expected` (spec §4.4 step 3). `expected = None` means "no
    /// prior model". Returns `SssError::ConditionFailed` (kind `Conflict`)
    /// if another writer won the race; the caller (MLM) is responsible for
    /// the re-read-and-retry-with-backoff loop.
    pub async fn swap_latest_pointer(
        &self,
        tile_id: &str,
        region_tag: &str,
        expected: Option<&str>,
        new_version: &str,
    ) -> Result<(), SssError> {
        let _permit = self.permit().await;
        let tree = self.db.open_tree(TREE)?;
        let key = pointer_key(tile_id, region_tag);
        let result = tree.compare_and_swap(
            key,
            expected.map(|s| s.as_bytes()),
            Some(new_version.as_bytes()),
        )?;
        result.map_err(|_| SssError::ConditionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_write_requires_none_expected() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.swap_latest_pointer("t1", "amazon", None, "v1").await.unwrap();
        assert_eq!(store.get_latest_pointer("t1", "amazon").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn concurrent_flip_one_wins() {
        let (store, _dir) = SharedStateStore::open_temp();
        store.swap_latest_pointer("t1", "amazon", None, "v1").await.unwrap();

        let ok = store.swap_latest_pointer("t1", "amazon", Some("v1"), "v2").await;
        let conflict = store.swap_latest_pointer("t1", "amazon", Some("v1"), "v3").await;

        assert!(ok.is_ok());
        assert!(conflict.is_err());
        assert_eq!(store.get_latest_pointer("t1", "amazon").await.unwrap(), Some("v2".to_string()));
    }
}
