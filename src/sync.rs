//! Multi-instance membership and metric sharing over the store.
//!
//! Every node publishes `node:<id>` with a short TTL and re-reads the full
//! membership each interval, so convergence needs nothing beyond the shared
//! key-value contract. Leadership is deterministic: the lexicographically
//! smallest live id. The leader holds no authority over the protection
//! pipeline; it only owns cross-cutting chores like retention cleanup.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::metrics::{labels, MetricsSink, SnapshotKind};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Heartbeat entry TTL. Independent of the sync interval so a store-side
/// expiry still reaps nodes whose process died between intervals.
const NODE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMetadata {
    pub pid: u32,
    pub hostname: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: String,
    pub last_heartbeat_millis: u64,
    pub metadata: NodeMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMessageKind {
    Metrics,
    Config,
}

/// Broadcast payload published at `sync:<kind>:<node_id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub kind: SyncMessageKind,
    pub node_id: String,
    pub sent_at_millis: u64,
    pub payload: serde_json::Value,
}

/// Observes membership changes. Callbacks run on the sync task.
pub trait SyncListener: Send + Sync {
    fn on_node_join(&self, node: &NodeInfo);
    fn on_node_leave(&self, node_id: &str);
}

pub struct DistributedSync {
    cfg: SyncConfig,
    store: Arc<dyn Store>,
    metrics: MetricsSink,
    clock: Arc<dyn Clock>,
    node_id: String,
    started_at_millis: u64,
    members: Mutex<HashMap<String, NodeInfo>>,
    listeners: Mutex<Vec<Arc<dyn SyncListener>>>,
    ticks: AtomicU64,
}

impl std::fmt::Debug for DistributedSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedSync")
            .field("node_id", &self.node_id)
            .field("members", &self.member_ids())
            .finish()
    }
}

impl DistributedSync {
    pub fn new(
        cfg: SyncConfig,
        store: Arc<dyn Store>,
        metrics: MetricsSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let node_id = cfg.node_id.clone().unwrap_or_else(generate_node_id);
        let started_at_millis = clock.now_millis();
        Self {
            cfg,
            store,
            metrics,
            clock,
            node_id,
            started_at_millis,
            members: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn add_listener(&self, listener: Arc<dyn SyncListener>) {
        self.listeners.lock().expect("sync listeners poisoned").push(listener);
    }

    /// Publish this node's heartbeat entry.
    pub async fn register(&self) {
        let info = self.own_info();
        match serde_json::to_value(&info) {
            Ok(value) => {
                if let Err(err) = self
                    .store
                    .set(&format!("node:{}", self.node_id), value, Some(NODE_TTL))
                    .await
                {
                    tracing::warn!(error = %err, "node registration failed");
                    self.metrics.increment("sync_errors", 1, labels([("op", "register")]));
                }
            }
            Err(err) => tracing::warn!(error = %err, "unserialisable node info"),
        }
    }

    /// Remove this node's entry. Called during shutdown.
    pub async fn unregister(&self) {
        if let Err(err) = self.store.delete(&format!("node:{}", self.node_id)).await {
            tracing::warn!(error = %err, "node unregistration failed");
        }
    }

    /// One sync round: refresh our entry, reconcile membership, broadcast a
    /// metrics snapshot.
    pub async fn heartbeat(&self) {
        self.register().await;
        self.reconcile().await;
        self.broadcast_metrics().await;
    }

    /// Remove heartbeat entries older than the dead-node threshold. Covers
    /// stores whose TTL support is weaker than the contract's.
    pub async fn cleanup(&self) {
        let threshold = self.cfg.dead_node_threshold().as_millis() as u64;
        let now = self.clock.now_millis();
        let keys = match self.store.scan("node:*").await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "cleanup scan failed");
                return;
            }
        };
        for key in keys {
            let Ok(Some(value)) = self.store.get(&key).await else {
                continue;
            };
            let Ok(info) = serde_json::from_value::<NodeInfo>(value) else {
                continue;
            };
            if now.saturating_sub(info.last_heartbeat_millis) > threshold {
                let _ = self.store.delete(&key).await;
                tracing::info!(node = %info.id, "removed dead node entry");
                self.metrics.increment("sync_dead_nodes_removed", 1, Vec::new());
            }
        }
    }

    /// Broadcast an arbitrary config payload to the cluster.
    pub async fn publish_config(&self, payload: serde_json::Value) {
        self.publish(SyncMessageKind::Config, payload).await;
    }

    /// Current live membership, sorted by id.
    pub fn members(&self) -> Vec<NodeInfo> {
        let members = self.members.lock().expect("sync members poisoned");
        let mut out: Vec<NodeInfo> = members.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members().into_iter().map(|m| m.id).collect()
    }

    /// The lexicographically smallest live node id.
    pub fn leader_id(&self) -> Option<String> {
        let members = self.members.lock().expect("sync members poisoned");
        members
            .keys()
            .chain(std::iter::once(&self.node_id))
            .min()
            .cloned()
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id().as_deref() == Some(self.node_id.as_str())
    }

    /// Sync loop: heartbeat every interval, cleanup every third one.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.register().await;
        let mut interval = tokio::time::interval(self.cfg.sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.heartbeat().await;
                    let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    if ticks % 3 == 0 {
                        self.cleanup().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.unregister().await;
                        break;
                    }
                }
            }
        }
    }

    fn own_info(&self) -> NodeInfo {
        let now = self.clock.now_millis();
        NodeInfo {
            id: self.node_id.clone(),
            last_heartbeat_millis: now,
            metadata: NodeMetadata {
                pid: std::process::id(),
                hostname: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "unknown".to_string()),
                uptime_secs: now.saturating_sub(self.started_at_millis) / 1000,
            },
        }
    }

    async fn reconcile(&self) {
        let keys = match self.store.scan("node:*").await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "membership scan failed");
                self.metrics.increment("sync_errors", 1, labels([("op", "scan")]));
                return;
            }
        };

        let mut live = HashMap::new();
        for key in keys {
            let Ok(Some(value)) = self.store.get(&key).await else {
                continue;
            };
            match serde_json::from_value::<NodeInfo>(value) {
                Ok(info) => {
                    live.insert(info.id.clone(), info);
                }
                Err(err) => tracing::warn!(key = %key, error = %err, "bad node entry"),
            }
        }

        let (joined, left) = {
            let mut members = self.members.lock().expect("sync members poisoned");
            let mut joined: Vec<NodeInfo> = live
                .values()
                .filter(|info| !members.contains_key(&info.id))
                .cloned()
                .collect();
            joined.sort_by(|a, b| a.id.cmp(&b.id));
            let mut left: Vec<String> =
                members.keys().filter(|id| !live.contains_key(*id)).cloned().collect();
            left.sort();
            *members = live;
            (joined, left)
        };

        // Listener callbacks run outside the membership lock.
        let listeners: Vec<Arc<dyn SyncListener>> =
            self.listeners.lock().expect("sync listeners poisoned").clone();
        for node in &joined {
            if node.id != self.node_id {
                tracing::info!(node = %node.id, "node joined");
            }
            for listener in &listeners {
                listener.on_node_join(node);
            }
        }
        for id in &left {
            tracing::info!(node = %id, "node left");
            for listener in &listeners {
                listener.on_node_leave(id);
            }
        }

        self.metrics.gauge(
            "sync_cluster_size",
            self.members.lock().expect("sync members poisoned").len() as f64,
            Vec::new(),
        );
    }

    async fn broadcast_metrics(&self) {
        let counters: serde_json::Map<String, serde_json::Value> = self
            .metrics
            .snapshot()
            .into_iter()
            .filter_map(|series| match series.kind {
                SnapshotKind::Counter { total, .. } => {
                    Some((series.name, serde_json::Value::from(total)))
                }
                _ => None,
            })
            .collect();
        self.publish(SyncMessageKind::Metrics, serde_json::Value::Object(counters)).await;
    }

    async fn publish(&self, kind: SyncMessageKind, payload: serde_json::Value) {
        let message = SyncMessage {
            kind,
            node_id: self.node_id.clone(),
            sent_at_millis: self.clock.now_millis(),
            payload,
        };
        let key = match kind {
            SyncMessageKind::Metrics => format!("sync:metrics:{}", self.node_id),
            SyncMessageKind::Config => format!("sync:config:{}", self.node_id),
        };
        match serde_json::to_value(&message) {
            Ok(value) => {
                if let Err(err) =
                    self.store.set(&key, value, Some(self.cfg.sync_interval)).await
                {
                    tracing::warn!(error = %err, "sync broadcast failed");
                    self.metrics.increment("sync_errors", 1, labels([("op", "publish")]));
                }
            }
            Err(err) => tracing::warn!(error = %err, "unserialisable sync message"),
        }
    }
}

fn generate_node_id() -> String {
    use rand::Rng;

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    let salt: u16 = rand::rng().random();
    format!("{}-{}-{:04x}", host, std::process::id(), salt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn sync_node(
        id: &str,
        store: Arc<MemoryStore>,
        clock: &ManualClock,
    ) -> Arc<DistributedSync> {
        let cfg = SyncConfig {
            enabled: true,
            node_id: Some(id.to_string()),
            sync_interval: Duration::from_secs(10),
            channel: "shield".to_string(),
        };
        Arc::new(DistributedSync::new(
            cfg,
            store,
            MetricsSink::with_clock(Arc::new(clock.clone())),
            Arc::new(clock.clone()),
        ))
    }

    fn shared_store(clock: &ManualClock) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())))
    }

    #[tokio::test]
    async fn nodes_discover_each_other_through_the_store() {
        let clock = ManualClock::new(0);
        let store = shared_store(&clock);
        let a = sync_node("node-a", store.clone(), &clock);
        let b = sync_node("node-b", store.clone(), &clock);

        a.heartbeat().await;
        b.heartbeat().await;
        a.heartbeat().await;

        assert_eq!(a.member_ids(), vec!["node-a", "node-b"]);
        assert_eq!(b.member_ids(), vec!["node-a", "node-b"]);
    }

    #[tokio::test]
    async fn leadership_is_the_smallest_live_id() {
        let clock = ManualClock::new(0);
        let store = shared_store(&clock);
        let b = sync_node("node-b", store.clone(), &clock);

        b.heartbeat().await;
        assert!(b.is_leader());

        let a = sync_node("node-a", store.clone(), &clock);
        a.heartbeat().await;
        b.heartbeat().await;
        assert!(!b.is_leader());
        assert_eq!(b.leader_id().unwrap(), "node-a");
        assert!(a.is_leader());
    }

    struct Recorder {
        joins: Mutex<Vec<String>>,
        leaves: Mutex<Vec<String>>,
    }

    impl SyncListener for Recorder {
        fn on_node_join(&self, node: &NodeInfo) {
            self.joins.lock().unwrap().push(node.id.clone());
        }
        fn on_node_leave(&self, node_id: &str) {
            self.leaves.lock().unwrap().push(node_id.to_string());
        }
    }

    #[tokio::test]
    async fn listeners_see_joins_and_ttl_expiry_leaves() {
        let clock = ManualClock::new(0);
        let store = shared_store(&clock);
        let a = sync_node("node-a", store.clone(), &clock);
        let recorder = Arc::new(Recorder {
            joins: Mutex::new(Vec::new()),
            leaves: Mutex::new(Vec::new()),
        });
        a.add_listener(recorder.clone());

        let b = sync_node("node-b", store.clone(), &clock);
        b.register().await;
        a.heartbeat().await;
        assert_eq!(*recorder.joins.lock().unwrap(), vec!["node-a", "node-b"]);

        // node-b stops heartbeating; its entry expires by TTL.
        clock.advance(61_000);
        a.heartbeat().await;
        assert_eq!(*recorder.leaves.lock().unwrap(), vec!["node-b"]);
        assert_eq!(a.member_ids(), vec!["node-a"]);
    }

    #[tokio::test]
    async fn heartbeats_publish_a_metrics_snapshot() {
        let clock = ManualClock::new(0);
        let store = shared_store(&clock);
        let a = sync_node("node-a", store.clone(), &clock);

        a.metrics.increment("guard_requests", 7, Vec::new());
        a.heartbeat().await;

        let raw = store.get("sync:metrics:node-a").await.unwrap().unwrap();
        let message: SyncMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.kind, SyncMessageKind::Metrics);
        assert_eq!(message.node_id, "node-a");
        assert_eq!(message.payload["guard_requests"], 7);
    }

    #[tokio::test]
    async fn cleanup_removes_entries_past_the_dead_threshold() {
        let clock = ManualClock::new(100_000);
        let store = shared_store(&clock);
        let a = sync_node("node-a", store.clone(), &clock);

        // A ghost entry without TTL, stale past 6 × sync_interval.
        let ghost = NodeInfo {
            id: "node-ghost".to_string(),
            last_heartbeat_millis: 10_000,
            metadata: NodeMetadata {
                pid: 1,
                hostname: "old-host".to_string(),
                uptime_secs: 1,
            },
        };
        store
            .set("node:node-ghost", serde_json::to_value(&ghost).unwrap(), None)
            .await
            .unwrap();

        a.register().await;
        a.cleanup().await;
        let keys = store.scan("node:*").await.unwrap();
        assert_eq!(keys, vec!["node:node-a"]);
    }

    #[tokio::test]
    async fn unregister_removes_the_heartbeat_entry() {
        let clock = ManualClock::new(0);
        let store = shared_store(&clock);
        let a = sync_node("node-a", store.clone(), &clock);

        a.register().await;
        assert!(store.exists("node:node-a").await.unwrap());
        a.unregister().await;
        assert!(!store.exists("node:node-a").await.unwrap());
    }
}
