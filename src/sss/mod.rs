//! Shared State Store (SSS) — spec.md §4.1.
//!
//! Durable persistence for `regions`, `alerts`, `analysis_runs` and the
//! supplemented `test_runs` table, plus an internal `model_pointers` table
//! the Model Lifecycle Manager needs for its atomic `latest`-version flip
//! (spec §4.4's "conditional update guarded on previous version" requires
//! somewhere to hold that pointer; spec §4.1's table list is described as
//! "required", not exhaustive).
//!
//! Backed by `sled`, the same embedded store the teacher uses for its own
//! history persistence. Writes to a single item are linearizable (sled
//! guarantees this per key); scans are a consistent snapshot at the time of
//! iteration but callers must not treat that as authoritative for
//! cross-item decisions, per spec's "eventually consistent scans" contract.

mod alerts;
mod analysis_runs;
mod model_pointers;
mod regions;
mod test_runs;

use crate::error::{ErrorKind, KindedError};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

// alerts, analysis_runs, model_pointers, regions and test_runs only add
// inherent methods to SharedStateStore below; they have no types of their
// own to re-export.

#[derive(Debug, thiserror::Error)]
pub enum SssError {
    #[error("sled error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found")]
    NotFound,
    #[error("conditional update failed: precondition no longer holds")]
    ConditionFailed,
    #[error("validation error: {0}")]
    Validation(String),
}

impl KindedError for SssError {
    fn kind(&self) -> ErrorKind {
        match self {
            SssError::NotFound => ErrorKind::NotFound,
            SssError::ConditionFailed => ErrorKind::Conflict,
            SssError::Validation(_) => ErrorKind::Validation,
            SssError::Storage(_) | SssError::Serialization(_) => ErrorKind::Transient,
        }
    }
}

impl From<sled::Error> for SssError {
    fn from(e: sled::Error) -> Self {
        SssError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SssError {
    fn from(e: serde_json::Error) -> Self {
        SssError::Serialization(e.to_string())
    }
}

/// Shared State Store handle. Cheap to clone (wraps an `Arc<sled::Db>`).
#[derive(Clone)]
pub struct SharedStateStore {
    pub(crate) db: Arc<sled::Db>,
    /// Bounds concurrent in-flight operations (spec §5 "connection limits
    /// default 100, overflow callers block with FIFO fairness"). `tokio::
    /// sync::Semaphore` is itself FIFO-fair among waiters.
    pub(crate) pool: Arc<Semaphore>,
}

impl SharedStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SssError> {
        let db = sled::open(path)?;
        let limit = if crate::config::is_initialized() {
            crate::config::get().coordinator.connection_pool_limit
        } else {
            crate::config::defaults::CONNECTION_POOL_LIMIT
        };
        Ok(Self {
            db: Arc::new(db),
            pool: Arc::new(Semaphore::new(limit)),
        })
    }

    #[cfg(test)]
    pub fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Self::open(dir.path()).expect("open sled");
        (store, dir)
    }

    async fn permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.pool.acquire().await.expect("semaphore closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_and_close_roundtrips() {
        let (store, _dir) = SharedStateStore::open_temp();
        assert!(store.db.tree_names().len() >= 1);
    }
}
