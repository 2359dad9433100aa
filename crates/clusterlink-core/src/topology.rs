//! Cluster topology snapshots and node selection.
//!
//! The current topology is an immutable [`TopologySnapshot`] behind an
//! atomically swapped pointer. Readers load it without locking; the refresh
//! loop publishes a fully formed replacement only when the cluster-reported
//! revision increased.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::circuitbreaker::BreakerRegistry;
use crate::error::{CoreError, Result};

/// Kind of service an operation is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Binary key/value protocol on the storage nodes.
    Kv,
    /// N1QL query service.
    Query,
    /// Analytics service.
    Analytics,
    /// Full-text search service.
    Search,
    /// Map/reduce views.
    Views,
    /// Cluster management REST API.
    Management,
}

impl ServiceKind {
    /// All service kinds.
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::Kv,
        ServiceKind::Query,
        ServiceKind::Analytics,
        ServiceKind::Search,
        ServiceKind::Views,
        ServiceKind::Management,
    ];

    /// Short name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Kv => "kv",
            ServiceKind::Query => "query",
            ServiceKind::Analytics => "analytics",
            ServiceKind::Search => "search",
            ServiceKind::Views => "views",
            ServiceKind::Management => "mgmt",
        }
    }

    /// Key under which the cluster config advertises this service's port.
    pub fn config_key(&self) -> &'static str {
        match self {
            ServiceKind::Kv => "kv",
            ServiceKind::Query => "n1ql",
            ServiceKind::Analytics => "cbas",
            ServiceKind::Search => "fts",
            ServiceKind::Views => "capi",
            ServiceKind::Management => "mgmt",
        }
    }

    /// Response field holding the streamed rows, for query-style services.
    pub fn row_field(&self) -> Option<&'static str> {
        match self {
            ServiceKind::Query | ServiceKind::Analytics => Some("results"),
            ServiceKind::Search => Some("hits"),
            ServiceKind::Views => Some("rows"),
            ServiceKind::Kv | ServiceKind::Management => None,
        }
    }

    pub(crate) fn from_config_key(key: &str) -> Option<Self> {
        ServiceKind::ALL
            .into_iter()
            .find(|service| service.config_key() == key)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Creates a node id from its string form.
    pub fn new(id: impl AsRef<str>) -> Self {
        NodeId(Arc::from(id.as_ref()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network endpoint of one service on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// Service port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// One node and the services it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node identity.
    pub id: NodeId,
    /// Host name or IP address.
    pub host: String,
    /// Advertised port per service.
    pub services: BTreeMap<ServiceKind, u16>,
}

impl NodeInfo {
    /// Creates a node, deriving its id from the host and its management
    /// port (or its lowest advertised port when management is absent).
    pub fn new(
        host: impl Into<String>,
        services: impl IntoIterator<Item = (ServiceKind, u16)>,
    ) -> Self {
        let host = host.into();
        let services: BTreeMap<ServiceKind, u16> = services.into_iter().collect();
        let id_port = services
            .get(&ServiceKind::Management)
            .copied()
            .or_else(|| services.values().min().copied())
            .unwrap_or(0);
        let id = NodeId::new(Endpoint::new(host.clone(), id_port).address());
        Self { id, host, services }
    }

    /// Returns the endpoint for `service`, if advertised.
    pub fn endpoint(&self, service: ServiceKind) -> Option<Endpoint> {
        self.services
            .get(&service)
            .map(|port| Endpoint::new(self.host.clone(), *port))
    }
}

/// Cluster-reported configuration revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision {
    /// Revision epoch; bumps invalidate all older revisions.
    pub epoch: i64,
    /// Revision number within the epoch.
    pub rev: i64,
}

impl Revision {
    /// Creates a revision.
    pub fn new(epoch: i64, rev: i64) -> Self {
        Self { epoch, rev }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.rev)
    }
}

/// Key to vBucket to active-server mapping for KV routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketMap {
    servers: Vec<String>,
    entries: Vec<Vec<i32>>,
}

impl VbucketMap {
    /// Creates a map from the KV server list and per-vBucket server indexes
    /// (active first, then replicas).
    pub fn new(servers: Vec<String>, entries: Vec<Vec<i32>>) -> Self {
        Self { servers, entries }
    }

    /// Number of vBuckets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map has no vBuckets.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hashes a document key to its vBucket.
    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        if self.entries.is_empty() {
            return 0;
        }
        let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
        (hash as usize % self.entries.len()) as u16
    }

    /// KV address of the active server for `vbucket`.
    pub fn active_server(&self, vbucket: u16) -> Option<&str> {
        let index = *self.entries.get(vbucket as usize)?.first()?;
        if index < 0 {
            return None;
        }
        self.servers.get(index as usize).map(String::as_str)
    }
}

/// Immutable view of the cluster at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    revision: Revision,
    bucket: Option<String>,
    nodes: Vec<NodeInfo>,
    vbuckets: Option<VbucketMap>,
}

impl TopologySnapshot {
    /// Creates a snapshot from its nodes.
    pub fn new(revision: Revision, nodes: Vec<NodeInfo>) -> Self {
        Self {
            revision,
            bucket: None,
            nodes,
            vbuckets: None,
        }
    }

    /// Sets the bucket this snapshot was obtained for.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Attaches a vBucket map.
    pub fn with_vbucket_map(mut self, map: VbucketMap) -> Self {
        self.vbuckets = Some(map);
        self
    }

    /// Configuration revision.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Bucket name, if this is a bucket-level config.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// All nodes.
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// vBucket map, if any.
    pub fn vbucket_map(&self) -> Option<&VbucketMap> {
        self.vbuckets.as_ref()
    }

    /// Looks up a node by id.
    pub fn node(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns `true` if any node advertises `service`.
    pub fn offers(&self, service: ServiceKind) -> bool {
        self.nodes.iter().any(|n| n.services.contains_key(&service))
    }

    /// Nodes advertising `service`, with their endpoint for it.
    pub fn candidates(&self, service: ServiceKind) -> Vec<(&NodeInfo, Endpoint)> {
        self.nodes
            .iter()
            .filter_map(|n| n.endpoint(service).map(|ep| (n, ep)))
            .collect()
    }

    /// Endpoint addresses for `service` across all nodes.
    pub fn addresses(&self, service: ServiceKind) -> Vec<String> {
        self.candidates(service)
            .into_iter()
            .map(|(_, ep)| ep.address())
            .collect()
    }

    fn node_by_kv_address(&self, addr: &str) -> Option<(&NodeInfo, Endpoint)> {
        self.candidates(ServiceKind::Kv)
            .into_iter()
            .find(|(_, ep)| ep.address() == addr)
    }
}

/// Chosen destination for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Node the attempt is sent to.
    pub node: NodeId,
    /// Service endpoint on that node.
    pub endpoint: Endpoint,
    /// Service kind.
    pub service: ServiceKind,
    /// vBucket for key-routed KV commands.
    pub vbucket: Option<u16>,
}

/// Result of node selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A node admitted by its breaker.
    Target(Target),
    /// Every candidate was rejected by its breaker; carries the first one.
    CircuitOpen(NodeId),
    /// No node advertises the service.
    NoCandidates,
    /// The key's vBucket has no active server in this snapshot.
    Unmapped {
        /// The unmapped vBucket.
        vbucket: u16,
    },
}

/// Configuration for topology refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Which protocol the refresh loop polls with.
    pub bootstrap: BootstrapMode,
    /// Period between polls (default: 2.5s).
    pub poll_interval_ms: u64,
    /// Bound on a single config fetch (default: 2.5s).
    pub poll_timeout_ms: u64,
    /// How long the HTTP poller stays on one node before rotating (default: 10s).
    pub http_redial_period_ms: u64,
    /// Wait after a failed HTTP poll round (default: 10s).
    pub http_retry_delay_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapMode::Both,
            poll_interval_ms: 2_500,
            poll_timeout_ms: 2_500,
            http_redial_period_ms: 10_000,
            http_retry_delay_ms: 10_000,
        }
    }
}

impl TopologyConfig {
    /// Poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-fetch bound.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// HTTP node rotation period.
    pub fn http_redial_period(&self) -> Duration {
        Duration::from_millis(self.http_redial_period_ms)
    }

    /// Delay after a failed HTTP round.
    pub fn http_retry_delay(&self) -> Duration {
        Duration::from_millis(self.http_retry_delay_ms)
    }
}

/// Protocol(s) used to obtain cluster configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapMode {
    /// Binary protocol only.
    Cccp,
    /// HTTP only.
    Http,
    /// Binary protocol, falling back to HTTP when unsupported.
    Both,
}

/// Holds the current snapshot and performs node selection.
pub struct TopologyManager {
    current: ArcSwapOption<TopologySnapshot>,
    publish_lock: Mutex<()>,
    revisions: watch::Sender<Option<Revision>>,
    cursor: AtomicUsize,
}

impl TopologyManager {
    /// Creates a manager with no snapshot.
    pub fn new() -> Self {
        let (revisions, _) = watch::channel(None);
        Self {
            current: ArcSwapOption::empty(),
            publish_lock: Mutex::new(()),
            revisions,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Latest published snapshot. Never blocks.
    pub fn current(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.load_full()
    }

    /// Revision of the latest published snapshot.
    pub fn revision(&self) -> Option<Revision> {
        self.current.load().as_ref().map(|s| s.revision())
    }

    /// Publishes `snapshot` if its revision is newer than the current one.
    ///
    /// Returns `true` if the snapshot was published.
    pub fn publish(&self, snapshot: TopologySnapshot) -> bool {
        let _writer = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());
        let revision = snapshot.revision();
        if let Some(current) = self.current.load().as_ref() {
            if revision <= current.revision() {
                debug!(
                    offered = %revision,
                    current = %current.revision(),
                    "ignoring topology that is not newer"
                );
                return false;
            }
        }
        let nodes = snapshot.nodes().len();
        self.current.store(Some(Arc::new(snapshot)));
        self.revisions.send_replace(Some(revision));
        info!(revision = %revision, nodes, "published topology");
        true
    }

    /// Subscribes to revision changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Revision>> {
        self.revisions.subscribe()
    }

    /// Waits until a snapshot newer than `than` is published.
    pub async fn wait_for_newer(&self, than: Option<Revision>) -> Revision {
        let mut rx = self.revisions.subscribe();
        let newer = rx
            .wait_for(|published| match (published, than) {
                (Some(published), Some(than)) => *published > than,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .await
            .map(|published| published.unwrap_or_default());
        match newer {
            Ok(revision) => revision,
            // The sender lives as long as `self`.
            Err(_) => std::future::pending().await,
        }
    }

    /// Waits up to `timeout` for the first snapshot.
    pub async fn wait_for_first(&self, timeout: Duration) -> Result<Arc<TopologySnapshot>> {
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }
        tokio::time::timeout(timeout, self.wait_for_newer(None))
            .await
            .map_err(|_| CoreError::TopologyUnavailable)?;
        self.current().ok_or(CoreError::TopologyUnavailable)
    }

    /// Picks a target for `service` in `snapshot`.
    ///
    /// Key-routed KV commands go to the vBucket's active server. Otherwise
    /// `preferred` is tried first, then candidates round-robin; every
    /// candidate is filtered through its circuit breaker.
    pub fn select(
        &self,
        snapshot: &TopologySnapshot,
        service: ServiceKind,
        key: Option<&[u8]>,
        preferred: Option<&NodeId>,
        breakers: &BreakerRegistry,
    ) -> Selection {
        if service == ServiceKind::Kv {
            if let (Some(key), Some(map)) = (key, snapshot.vbucket_map()) {
                let vbucket = map.vbucket_for_key(key);
                let master = map
                    .active_server(vbucket)
                    .and_then(|addr| snapshot.node_by_kv_address(addr));
                return match master {
                    Some((node, endpoint)) if breakers.allow(&node.id, service) => {
                        Selection::Target(Target {
                            node: node.id.clone(),
                            endpoint,
                            service,
                            vbucket: Some(vbucket),
                        })
                    }
                    Some((node, _)) => Selection::CircuitOpen(node.id.clone()),
                    None => Selection::Unmapped { vbucket },
                };
            }
        }

        let candidates = snapshot.candidates(service);
        if candidates.is_empty() {
            return Selection::NoCandidates;
        }
        let target = |node: &NodeInfo, endpoint: &Endpoint| {
            Selection::Target(Target {
                node: node.id.clone(),
                endpoint: endpoint.clone(),
                service,
                vbucket: None,
            })
        };

        if let Some(preferred) = preferred {
            if let Some((node, endpoint)) = candidates.iter().find(|(n, _)| &n.id == preferred) {
                if breakers.allow(&node.id, service) {
                    return target(node, endpoint);
                }
            }
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let mut rejected = None;
        for i in 0..candidates.len() {
            let (node, endpoint) = &candidates[(start + i) % candidates.len()];
            if breakers.allow(&node.id, service) {
                return target(node, endpoint);
            }
            rejected.get_or_insert_with(|| node.id.clone());
        }
        match rejected {
            Some(node) => Selection::CircuitOpen(node),
            None => Selection::NoCandidates,
        }
    }
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuitbreaker::{CallOutcome, CircuitBreakerConfig, TripPolicyKind};

    fn node(host: &str, kv: u16, query: Option<u16>) -> NodeInfo {
        let mut services = vec![(ServiceKind::Kv, kv), (ServiceKind::Management, kv + 1)];
        if let Some(port) = query {
            services.push((ServiceKind::Query, port));
        }
        NodeInfo::new(host, services)
    }

    fn snapshot(rev: i64) -> TopologySnapshot {
        TopologySnapshot::new(
            Revision::new(1, rev),
            vec![
                node("10.0.0.1", 11210, Some(8093)),
                node("10.0.0.2", 11210, Some(8093)),
                node("10.0.0.3", 11210, None),
            ],
        )
    }

    fn breakers() -> BreakerRegistry {
        BreakerRegistry::new(CircuitBreakerConfig {
            policy: TripPolicyKind::ConsecutiveFailures,
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        })
    }

    #[test]
    fn test_endpoint_address_ipv6() {
        assert_eq!(Endpoint::new("::1", 8091).address(), "[::1]:8091");
        assert_eq!(Endpoint::new("host", 8091).address(), "host:8091");
    }

    #[test]
    fn test_node_id_prefers_management_port() {
        let n = node("10.0.0.1", 11210, None);
        assert_eq!(n.id.as_str(), "10.0.0.1:11211");
    }

    #[test]
    fn test_publish_only_newer() {
        let manager = TopologyManager::new();
        assert!(manager.current().is_none());
        assert!(manager.publish(snapshot(5)));
        assert!(!manager.publish(snapshot(5)));
        assert!(!manager.publish(snapshot(4)));
        assert_eq!(manager.revision(), Some(Revision::new(1, 5)));
        assert!(manager.publish(snapshot(6)));
        assert_eq!(manager.revision(), Some(Revision::new(1, 6)));
    }

    #[test]
    fn test_epoch_dominates_revision() {
        let manager = TopologyManager::new();
        assert!(manager.publish(snapshot(100)));
        let next_epoch = TopologySnapshot::new(Revision::new(2, 1), vec![]);
        assert!(manager.publish(next_epoch));
    }

    #[test]
    fn test_readers_keep_old_snapshot() {
        let manager = TopologyManager::new();
        manager.publish(snapshot(1));
        let held = manager.current().unwrap();
        manager.publish(snapshot(2));
        assert_eq!(held.revision(), Revision::new(1, 1));
        assert_eq!(manager.current().unwrap().revision(), Revision::new(1, 2));
    }

    #[test]
    fn test_select_round_robin() {
        let manager = TopologyManager::new();
        let snap = snapshot(1);
        let breakers = breakers();
        let mut seen = Vec::new();
        for _ in 0..4 {
            match manager.select(&snap, ServiceKind::Query, None, None, &breakers) {
                Selection::Target(t) => seen.push(t.node),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_ne!(seen[0], seen[1]);
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);
    }

    #[test]
    fn test_select_no_candidates() {
        let manager = TopologyManager::new();
        let snap = snapshot(1);
        assert_eq!(
            manager.select(&snap, ServiceKind::Search, None, None, &breakers()),
            Selection::NoCandidates
        );
    }

    #[test]
    fn test_select_skips_open_breaker() {
        let manager = TopologyManager::new();
        let snap = snapshot(1);
        let breakers = breakers();
        let first = snap.nodes()[0].id.clone();
        breakers.report(&first, ServiceKind::Query, CallOutcome::Failure);
        for _ in 0..4 {
            match manager.select(&snap, ServiceKind::Query, None, None, &breakers) {
                Selection::Target(t) => assert_ne!(t.node, first),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_select_all_rejected() {
        let manager = TopologyManager::new();
        let snap = snapshot(1);
        let breakers = breakers();
        for n in snap.nodes() {
            breakers.report(&n.id, ServiceKind::Query, CallOutcome::Failure);
        }
        assert!(matches!(
            manager.select(&snap, ServiceKind::Query, None, None, &breakers),
            Selection::CircuitOpen(_)
        ));
    }

    #[test]
    fn test_select_preferred_node() {
        let manager = TopologyManager::new();
        let snap = snapshot(1);
        let preferred = snap.nodes()[1].id.clone();
        for _ in 0..3 {
            match manager.select(&snap, ServiceKind::Query, None, Some(&preferred), &breakers()) {
                Selection::Target(t) => assert_eq!(t.node, preferred),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_select_vbucket_master() {
        let manager = TopologyManager::new();
        let map = VbucketMap::new(
            vec!["10.0.0.1:11210".to_string(), "10.0.0.2:11210".to_string()],
            vec![vec![0, 1], vec![1, 0], vec![-1, 0], vec![1, -1]],
        );
        let snap = snapshot(1).with_vbucket_map(map.clone());
        let key = b"user::1001";
        let vb = map.vbucket_for_key(key);
        match manager.select(&snap, ServiceKind::Kv, Some(key), None, &breakers()) {
            Selection::Target(t) => {
                assert_eq!(t.vbucket, Some(vb));
                assert_eq!(t.endpoint.address(), map.active_server(vb).unwrap());
            }
            Selection::Unmapped { vbucket } => assert_eq!(map.active_server(vbucket), None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vbucket_active_server_negative() {
        let map = VbucketMap::new(vec!["a:1".to_string()], vec![vec![-1]]);
        assert_eq!(map.active_server(0), None);
        assert_eq!(map.active_server(5), None);
    }

    #[tokio::test]
    async fn test_wait_for_newer() {
        let manager = Arc::new(TopologyManager::new());
        manager.publish(snapshot(1));
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_newer(Some(Revision::new(1, 1))).await })
        };
        tokio::task::yield_now().await;
        manager.publish(snapshot(2));
        assert_eq!(waiter.await.unwrap(), Revision::new(1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_first_times_out() {
        let manager = TopologyManager::new();
        let err = manager
            .wait_for_first(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::TopologyUnavailable);
    }
}
