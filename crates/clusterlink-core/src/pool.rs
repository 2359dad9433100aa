//! Per-node pools of multiplexed KV connections.
//!
//! Connections are shared rather than checked out exclusively: a checkout
//! hands back an `Arc` to a live connection, dialing a new one while the
//! node holds fewer than `kv_pool_size`. Broken connections are pruned on
//! the next checkout. Dials happen outside the node's lock; a slot is
//! reserved first so concurrent checkouts never exceed the pool size.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::connection::{ConnError, ConnectSetup, KvConnection};
use crate::deadline::Deadline;
use crate::topology::Endpoint;

/// KV connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections per node (default: 1).
    pub kv_pool_size: usize,
    /// In-flight requests per connection (default: 2048).
    pub max_queue_size: usize,
    /// Bound on connect plus handshake (default: 7s).
    pub kv_connect_timeout_ms: u64,
    /// Abandoned requests left unanswered this long poison their
    /// connection (default: 10s).
    pub kv_abandoned_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kv_pool_size: 1,
            max_queue_size: 2048,
            kv_connect_timeout_ms: 7_000,
            kv_abandoned_timeout_ms: 10_000,
        }
    }
}

impl PoolConfig {
    /// Connect timeout.
    pub fn kv_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_connect_timeout_ms)
    }

    /// Abandoned request timeout.
    pub fn kv_abandoned_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_abandoned_timeout_ms)
    }
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Nodes with a pool.
    pub nodes: usize,
    /// Live connections across all nodes.
    pub connections: usize,
}

#[derive(Default)]
struct NodePool {
    conns: Mutex<Vec<Arc<KvConnection>>>,
    /// Dials in progress; each holds a slot toward `kv_pool_size`.
    dialing: AtomicUsize,
    dialed: Notify,
    cursor: AtomicUsize,
}

impl NodePool {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<KvConnection>>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases a reserved dial slot and wakes checkouts waiting on it.
struct DialSlot<'a>(&'a NodePool);

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        self.0.dialing.fetch_sub(1, Ordering::AcqRel);
        self.0.dialed.notify_waiters();
    }
}

/// Connection pools keyed by node KV address.
pub struct KvPool {
    config: PoolConfig,
    setup: ConnectSetup,
    nodes: DashMap<String, Arc<NodePool>>,
}

impl KvPool {
    /// Creates an empty pool. `setup` supplies handshake parameters; its
    /// timeouts and queue size are overridden from `config`.
    pub fn new(config: PoolConfig, mut setup: ConnectSetup) -> Self {
        setup.connect_timeout = config.kv_connect_timeout();
        setup.max_queue = config.max_queue_size;
        setup.abandon_timeout = config.kv_abandoned_timeout();
        Self {
            config,
            setup,
            nodes: DashMap::new(),
        }
    }

    /// Returns a live connection to `endpoint`, dialing one if needed. A
    /// dial never outlives `deadline`.
    pub async fn checkout(
        &self,
        endpoint: &Endpoint,
        deadline: Option<Deadline>,
    ) -> Result<Arc<KvConnection>, ConnError> {
        let addr = endpoint.address();
        let node = self
            .nodes
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(NodePool::default()))
            .clone();
        let size = self.config.kv_pool_size.max(1);

        loop {
            let dialed = node.dialed.notified();
            let reserved = {
                let mut conns = node.lock();
                let before = conns.len();
                conns.retain(|c| !c.is_broken());
                if conns.len() < before {
                    debug!(addr = %addr, pruned = before - conns.len(), "pruned broken kv connections");
                }
                if conns.len() + node.dialing.load(Ordering::Acquire) < size {
                    node.dialing.fetch_add(1, Ordering::AcqRel);
                    true
                } else if !conns.is_empty() {
                    let index = node.cursor.fetch_add(1, Ordering::Relaxed) % conns.len();
                    return Ok(conns[index].clone());
                } else {
                    false
                }
            };
            if !reserved {
                // Every slot is being dialed; wait for one to finish.
                dialed.await;
                continue;
            }

            let slot = DialSlot(node.as_ref());
            let timeout = match deadline {
                Some(deadline) => deadline.cap(self.setup.connect_timeout),
                None => self.setup.connect_timeout,
            };
            let conn = Arc::new(KvConnection::connect_within(endpoint, &self.setup, timeout).await?);
            node.lock().push(conn.clone());
            drop(slot);
            return Ok(conn);
        }
    }

    /// Drops pools for nodes whose address is not in `live`.
    pub fn retain_nodes(&self, live: &[String]) {
        self.nodes.retain(|addr, _| live.contains(addr));
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for node in self.nodes.iter() {
            stats.nodes += 1;
            stats.connections += node.lock().iter().filter(|c| !c.is_broken()).count();
        }
        stats
    }

    /// Drops every connection.
    pub fn close(&self) {
        self.nodes.clear();
    }
}
