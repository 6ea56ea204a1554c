//! Distributed Coordinator (DC) — spec.md §4.3.
//!
//! Coordinates cron-ownership and streaming-session claims across API
//! replicas. Modeled as a trait (`Coordinator`) with two implementations:
//! an in-process `dashmap`-backed claim table (`InMemoryCoordinator`) that
//! stands in for a real Redis-backed deployment, and a `NullCoordinator`
//! fallback used when no coordinator is reachable — every `claim` call
//! succeeds and a degradation warning is logged once, exactly per spec's
//! "claim is atomic... if DC is unreachable, all claim calls return true"
//! contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no subscribers for channel {0}")]
    NoSubscribers(String),
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub connected: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: String,
    pub metadata: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Atomic set-if-absent with expiry.
    async fn claim(&self, key: &str, ttl: Duration) -> bool;
    /// Succeeds only if the current holder is still the owner (re-claims
    /// the same key, extending its TTL).
    async fn refresh(&self, key: &str, ttl: Duration) -> bool;
    async fn release(&self, key: &str);

    async fn set_client(&self, client_id: &str, info: serde_json::Value, ttl: Duration);
    async fn get_client(&self, client_id: &str) -> Option<ClientInfo>;
    async fn remove_client(&self, client_id: &str);

    async fn publish(&self, channel: &str, msg: serde_json::Value);
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value>;

    async fn health(&self) -> HealthReport;
}

struct Claim {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// In-process coordinator: a `dashmap` claim table with lazily-checked TTL
/// expiry, plus one `broadcast` channel per pub/sub topic. This is the
/// concrete implementation a real multi-process deployment would back with
/// Redis; the `Coordinator` trait is the seam such an implementation would
/// plug into.
pub struct InMemoryCoordinator {
    claims: DashMap<String, Claim>,
    clients: DashMap<String, ClientInfo>,
    channels: DashMap<String, broadcast::Sender<serde_json::Value>>,
    replica_id: String,
}

impl InMemoryCoordinator {
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self {
            claims: DashMap::new(),
            clients: DashMap::new(),
            channels: DashMap::new(),
            replica_id: replica_id.into(),
        }
    }

    fn is_expired(claim: &Claim) -> bool {
        Utc::now() >= claim.expires_at
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn claim(&self, key: &str, ttl: Duration) -> bool {
        let now_expiry = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        match self.claims.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Claim { holder: self.replica_id.clone(), expires_at: now_expiry });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                if Self::is_expired(o.get()) {
                    o.insert(Claim { holder: self.replica_id.clone(), expires_at: now_expiry });
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> bool {
        match self.claims.get_mut(key) {
            Some(mut claim) if claim.holder == self.replica_id && !Self::is_expired(&claim) => {
                claim.expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
                true
            }
            _ => false,
        }
    }

    async fn release(&self, key: &str) {
        self.claims.remove(key);
    }

    async fn set_client(&self, client_id: &str, info: serde_json::Value, ttl: Duration) {
        self.clients.insert(
            client_id.to_string(),
            ClientInfo {
                client_id: client_id.to_string(),
                metadata: info,
                expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
            },
        );
    }

    async fn get_client(&self, client_id: &str) -> Option<ClientInfo> {
        self.clients.get(client_id).and_then(|c| {
            if Utc::now() < c.expires_at {
                Some(c.clone())
            } else {
                None
            }
        })
    }

    async fn remove_client(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    async fn publish(&self, channel: &str, msg: serde_json::Value) {
        if let Some(tx) = self.channels.get(channel) {
            let _ = tx.send(msg);
        }
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    async fn health(&self) -> HealthReport {
        HealthReport { connected: true, latency_ms: 0 }
    }
}

/// Single-replica fallback used when no real coordinator is reachable.
/// Every claim succeeds; a degradation warning fires once.
pub struct NullCoordinator {
    warned: AtomicBool,
}

impl Default for NullCoordinator {
    fn default() -> Self {
        Self { warned: AtomicBool::new(false) }
    }
}

impl NullCoordinator {
    fn warn_once(&self) {
        if self.warned.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            tracing::warn!("distributed coordinator unreachable — running in degraded single-replica mode");
        }
    }
}

#[async_trait]
impl Coordinator for NullCoordinator {
    async fn claim(&self, _key: &str, _ttl: Duration) -> bool {
        self.warn_once();
        true
    }

    async fn refresh(&self, _key: &str, _ttl: Duration) -> bool {
        self.warn_once();
        true
    }

    async fn release(&self, _key: &str) {}

    async fn set_client(&self, _client_id: &str, _info: serde_json::Value, _ttl: Duration) {}
    async fn get_client(&self, _client_id: &str) -> Option<ClientInfo> {
        None
    }
    async fn remove_client(&self, _client_id: &str) {}

    async fn publish(&self, _channel: &str, _msg: serde_json::Value) {}
    fn subscribe(&self, _channel: &str) -> broadcast::Receiver<serde_json::Value> {
        broadcast::channel(1).1
    }

    async fn health(&self) -> HealthReport {
        HealthReport { connected: false, latency_ms: 0 }
    }
}

pub type SharedCoordinator = Arc<dyn Coordinator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_until_expiry() {
        let dc = InMemoryCoordinator::new("replica-a");
        assert!(dc.claim("scheduler:r1", Duration::from_millis(50)).await);
        assert!(!dc.claim("scheduler:r1", Duration::from_secs(60)).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(dc.claim("scheduler:r1", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn refresh_requires_current_ownership() {
        let dc = InMemoryCoordinator::new("replica-a");
        assert!(dc.claim("scheduler:r1", Duration::from_secs(60)).await);
        assert!(dc.refresh("scheduler:r1", Duration::from_secs(60)).await);

        dc.release("scheduler:r1").await;
        assert!(!dc.refresh("scheduler:r1", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn null_coordinator_always_claims() {
        let dc = NullCoordinator::default();
        assert!(dc.claim("anything", Duration::from_secs(1)).await);
        assert!(dc.claim("anything", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn pubsub_roundtrip() {
        let dc = InMemoryCoordinator::new("replica-a");
        let mut rx = dc.subscribe("alerts");
        dc.publish("alerts", serde_json::json!({"hello": "world"})).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["hello"], "world");
    }
}
