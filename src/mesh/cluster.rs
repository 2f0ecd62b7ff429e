//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for shared rate limit counters.
//! Each node publishes values only in its own node state; readers collect
//! the values every live node holds for a key and reconcile them.
//!
//! Every published value carries a deadline. A sweeper task deletes our keys
//! once their deadline passes, and chitchat drops the resulting tombstones on
//! every node after `dead_node_grace_period`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

const COUNTER_PREFIX: &str = "counter|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before deleted keys and dead nodes' state are dropped.
    pub dead_node_grace_period: Duration,
    /// How often expired keys are deleted from our node state.
    pub sweep_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "turnstile".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Key identifying a rate limit counter in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The hashed storage key of the counter.
    pub storage_key: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(storage_key: &str) -> Self {
        Self {
            storage_key: storage_key.to_string(),
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "counter|{storage_key}"
    pub fn to_chitchat_key(&self) -> String {
        format!("{}{}", COUNTER_PREFIX, self.storage_key)
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let storage_key = key.strip_prefix(COUNTER_PREFIX)?;
        if storage_key.is_empty() || storage_key.contains('|') {
            return None;
        }
        Some(Self::new(storage_key))
    }
}

/// Deadlines of the keys we published, by chitchat key.
type Deadlines = Arc<SyncMutex<HashMap<String, Instant>>>;

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    deadlines: Deadlines,
    sweeper: JoinHandle<()>,
}

/// Delete our keys whose deadline has passed. Returns how many were deleted.
///
/// Callers hold the chitchat lock, so a concurrent publish cannot slip in
/// between the deadline check and the delete.
fn sweep_expired(chitchat: &mut Chitchat, deadlines: &Deadlines) -> usize {
    let now = Instant::now();
    let mut expired = Vec::new();
    deadlines.lock().retain(|key, deadline| {
        if *deadline <= now {
            expired.push(key.clone());
            false
        } else {
            true
        }
    });

    let node_state = chitchat.self_node_state();
    for key in &expired {
        node_state.delete(key);
    }
    expired.len()
}

fn spawn_sweeper(
    chitchat: Arc<Mutex<Chitchat>>,
    deadlines: Deadlines,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let mut chitchat = chitchat.lock().await;
            let swept = sweep_expired(&mut chitchat, &deadlines);
            if swept > 0 {
                trace!(swept, "Deleted expired cluster keys");
            }
        }
    })
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        let deadlines = Deadlines::default();
        let sweeper = spawn_sweeper(
            handle.chitchat(),
            deadlines.clone(),
            config.sweep_interval,
        );

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
            deadlines,
            sweeper,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish our value for a counter key; it reaches peers on the next gossip rounds.
    ///
    /// The key is deleted from our node state once `ttl` has passed.
    pub async fn publish(&self, key: &CounterKey, value: &str, ttl: Duration) {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        chitchat.self_node_state().set(&chitchat_key, value);
        let mut deadlines = self.deadlines.lock();
        match Instant::now().checked_add(ttl) {
            Some(deadline) => deadlines.insert(chitchat_key.clone(), deadline),
            None => deadlines.remove(&chitchat_key),
        };

        debug!(key = %chitchat_key, ttl_ms = ttl.as_millis() as u64, "Published counter state");
    }

    /// Count the counter keys held in our node state, tombstones included.
    #[cfg(test)]
    pub(crate) async fn stored_key_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat
            .self_node_state()
            .key_values_including_deleted()
            .filter(|(key, _)| key.starts_with(COUNTER_PREFIX))
            .count()
    }

    /// Collect the values all live nodes (ourselves included) hold for a key.
    pub async fn values(&self, key: &CounterKey) -> Vec<String> {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        let mut values = Vec::new();
        for node_id in chitchat.live_nodes() {
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some(value) = node_state.get(&chitchat_key) {
                    values.push(value.to_string());
                }
            }
        }

        values
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.sweeper.abort();
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
