//! Object Store (OS) — spec.md §4.2.
//!
//! Filesystem-backed, content-addressed-by-key blob storage. Key namespaces
//! are preserved verbatim as relative paths (forward slashes kept literally)
//! so any downstream tooling that expects the documented key layout can
//! still `list` by prefix, matching the teacher's own disk-backed
//! `fleet::queue::UploadQueue` idiom of one file per logical entry under a
//! directory tree.

use crate::error::{ErrorKind, KindedError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key outside of object store root: {0}")]
    InvalidKey(String),
}

impl KindedError for ObjectStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            ObjectStoreError::NotFound(_) => ErrorKind::NotFound,
            ObjectStoreError::InvalidKey(_) => ErrorKind::Validation,
            ObjectStoreError::Io(_) => ErrorKind::Transient,
        }
    }
}

/// A listed object's metadata.
#[derive(Debug, Clone)]
pub struct ObjectListing {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// A time-limited handle for external download. Since no real HTTP surface
/// exists in-core, this is a `file://` stand-in annotated with the expiry a
/// real signer would enforce.
#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
    pool: Arc<Semaphore>,
}

impl ObjectStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, ObjectStoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| ObjectStoreError::Io(e.to_string()))?;
        let limit = if crate::config::is_initialized() {
            crate::config::get().coordinator.connection_pool_limit
        } else {
            crate::config::defaults::CONNECTION_POOL_LIMIT
        };
        Ok(Self { root, pool: Arc::new(Semaphore::new(limit)) })
    }

    #[cfg(test)]
    pub fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Self::open(dir.path()).expect("open object store");
        (store, dir)
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.contains("..") || key.starts_with('/') {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    /// `put(key, bytes, metadata?)` — overwrites permitted.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let _permit = self.pool.acquire().await.expect("semaphore closed");
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ObjectStoreError::Io(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ObjectStoreError::Io(e.to_string()))
    }

    /// `get(key)` -> bytes.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let _permit = self.pool.acquire().await.expect("semaphore closed");
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound(key.to_string())
            } else {
                ObjectStoreError::Io(e.to_string())
            }
        })
    }

    /// `list(prefix, max?)` -> sequence of `(key, size, last_modified)`.
    pub async fn list(&self, prefix: &str, max: Option<usize>) -> Result<Vec<ObjectListing>, ObjectStoreError> {
        let _permit = self.pool.acquire().await.expect("semaphore closed");
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || list_blocking(&root, &prefix, max))
            .await
            .map_err(|e| ObjectStoreError::Io(e.to_string()))?
    }

    /// `signed_url(key, ttl)` -> time-limited URL.
    pub async fn signed_url(&self, key: &str, ttl_secs: i64) -> Result<SignedUrl, ObjectStoreError> {
        let path = self.resolve(key)?;
        Ok(SignedUrl {
            url: format!("file://{}", path.display()),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        })
    }

    /// `delete(key)`.
    pub async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let _permit = self.pool.acquire().await.expect("semaphore closed");
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStoreError::Io(e.to_string())),
        }
    }
}

fn list_blocking(root: &Path, prefix: &str, max: Option<usize>) -> Result<Vec<ObjectListing>, ObjectStoreError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path
                .strip_prefix(root)
                .map_err(|e| ObjectStoreError::Io(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            if !rel.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| ObjectStoreError::Io(e.to_string()))?;
            let last_modified = meta
                .modified()
                .ok()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            out.push(ObjectListing { key: rel, size: meta.len(), last_modified });
            if let Some(max) = max {
                if out.len() >= max {
                    return Ok(out);
                }
            }
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

/// Key namespace builders, bit-exact with spec.md §4.2.
pub mod keys {
    pub fn geospatial_data(year: i32, month: u32, day: u32, run_id: &str) -> String {
        format!("geospatial-data/year={year}/month={month:02}/day={day:02}/{run_id}.json")
    }

    pub fn model_artifact(tile_id: &str, region_tag: &str, version: &str) -> String {
        format!("models/{tile_id}/{region_tag}/{version}/model.bin")
    }

    pub fn model_metadata(tile_id: &str, region_tag: &str, version: &str) -> String {
        format!("models/{tile_id}/{region_tag}/{version}/metadata.json")
    }

    pub fn model_performance_history(tile_id: &str) -> String {
        format!("model-performance/{tile_id}/history.json")
    }

    pub fn visualization(region_id: &str, tile_id: &str, timestamp: i64, chart_type: &str) -> String {
        format!("visualizations/{region_id}/{tile_id}/{timestamp}/{chart_type}.png")
    }

    pub fn report(timestamp: i64, risk_level: &str) -> String {
        format!("reports/{timestamp}/report_{risk_level}_{timestamp}.pdf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (store, _dir) = ObjectStore::open_temp();
        store.put("models/t1/amazon/v1/model.bin", b"hello").await.unwrap();
        let bytes = store.get("models/t1/amazon/v1/model.bin").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (store, _dir) = ObjectStore::open_temp();
        let err = store.get("nope").await.unwrap_err();
        matches!(err, ObjectStoreError::NotFound(_));
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let (store, _dir) = ObjectStore::open_temp();
        store.put("models/t1/amazon/v1/model.bin", b"a").await.unwrap();
        store.put("models/t1/amazon/v2/model.bin", b"b").await.unwrap();
        store.put("reports/1/report_LOW_1.pdf", b"c").await.unwrap();

        let listing = store.list("models/t1", None).await.unwrap();
        assert_eq!(listing.len(), 2);
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let (store, _dir) = ObjectStore::open_temp();
        let err = store.put("../escape", b"x").await.unwrap_err();
        matches!(err, ObjectStoreError::InvalidKey(_));
    }

    #[test]
    fn key_namespaces_match_spec() {
        assert_eq!(
            keys::model_artifact("T1", "amazon", "v1"),
            "models/T1/amazon/v1/model.bin"
        );
        assert_eq!(
            keys::model_performance_history("T1"),
            "model-performance/T1/history.json"
        );
    }
}
