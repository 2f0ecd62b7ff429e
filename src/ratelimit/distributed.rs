//! Distributed counter store using Chitchat cluster state.
//!
//! Every node publishes the counters it writes in its own node state as a
//! small JSON envelope. A read collects the envelopes for a key from all live
//! nodes and keeps the most recently written one, so the cluster converges
//! on the last writer. Removal publishes a tombstone rather than deleting,
//! which lets the removal itself win over older envelopes held by peers.
//! Envelopes and tombstones leave the node state once their TTL has passed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::mesh::{Cluster, CounterKey};

use super::backend::{CounterStore, StorageError};
use super::counter::RateLimitCounter;

const TOMBSTONE_TTL: Duration = Duration::from_secs(3600);

/// What a node publishes for one counter key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    /// The counter, or `None` for a removal.
    counter: Option<RateLimitCounter>,
    expires_at: DateTime<Utc>,
    written_at: DateTime<Utc>,
    node_id: String,
}

impl Envelope {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Pick the newest envelope among peer values and return its counter if live.
fn resolve(values: &[String], now: DateTime<Utc>) -> Option<RateLimitCounter> {
    let latest = values
        .iter()
        .filter_map(|raw| match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable counter envelope");
                None
            }
        })
        .max_by(|a, b| {
            a.written_at
                .cmp(&b.written_at)
                .then_with(|| a.node_id.cmp(&b.node_id))
        })?;

    if !latest.is_live(now) {
        return None;
    }
    latest.counter
}

/// A counter store backed by Chitchat cluster state.
///
/// Writes are visible locally at once and reach peers within a few gossip
/// rounds. Concurrent writers on different nodes are not serialized, so two
/// nodes admitting at the same moment may both count from the same previous
/// value.
pub struct ClusterCounterStore {
    /// The cluster for distributed state.
    cluster: Arc<Cluster>,
}

impl ClusterCounterStore {
    /// Create a new store over a running cluster.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    async fn publish(
        &self,
        key: &str,
        counter: Option<RateLimitCounter>,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or_else(|| now + TimeDelta::days(3650));

        let envelope = Envelope {
            counter,
            expires_at,
            written_at: now,
            node_id: self.cluster.node_id().to_string(),
        };
        let value = serde_json::to_string(&envelope)?;

        self.cluster.publish(&CounterKey::new(key), &value, ttl).await;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for ClusterCounterStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitCounter>, StorageError> {
        let values = self.cluster.values(&CounterKey::new(key)).await;
        let counter = resolve(&values, Utc::now());

        trace!(key = %key, peers = values.len(), found = counter.is_some(), "Read cluster counter");
        Ok(counter)
    }

    async fn set(
        &self,
        key: &str,
        counter: RateLimitCounter,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        self.publish(key, Some(counter), ttl).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        // Outlives the envelopes it shadows on peers.
        self.publish(key, None, TOMBSTONE_TTL).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
