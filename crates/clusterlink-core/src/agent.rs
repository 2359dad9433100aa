//! The agent: one handle owning every long-lived part of the core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::auth::Authenticator;
use crate::cancel::{CancelReason, OperationHandle};
use crate::circuitbreaker::{BreakerRegistry, CircuitState};
use crate::config::CoreConfig;
use crate::connection::ConnectSetup;
use crate::dispatcher::TransportDispatcher;
use crate::error::Result;
use crate::http::HttpDispatcher;
use crate::orphan::OrphanReporter;
use crate::poller::{seed_nodes, CccpPoller, ConfigRefresher, ConfigSource, HttpConfigPoller};
use crate::pool::{KvPool, PoolStats};
use crate::registry::{OperationRegistry, RegistryParts};
use crate::request::{OperationRequest, OperationResponse};
use crate::retry::RetryOrchestrator;
use crate::topology::{BootstrapMode, NodeId, ServiceKind, TopologyManager, TopologySnapshot};
use crate::tracer::RequestTracer;

/// Entry point for issuing operations against a cluster.
///
/// Background work (config refresh, orphan reporting, pruning state for
/// nodes that left the cluster) runs until [`Agent::close`] is called or
/// the agent is dropped.
pub struct Agent {
    topology: Arc<TopologyManager>,
    breakers: Arc<BreakerRegistry>,
    pool: Arc<KvPool>,
    registry: OperationRegistry,
    orphans: Arc<OrphanReporter>,
    operations: TaskTracker,
    background: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Agent {
    /// Validates `config`, builds the core and starts its background tasks.
    ///
    /// Returns without waiting for a cluster config; use
    /// [`Agent::wait_until_ready`] for that.
    pub async fn connect(
        config: CoreConfig,
        authenticator: Arc<dyn Authenticator>,
        tracer: Arc<dyn RequestTracer>,
    ) -> Result<Agent> {
        config.validate()?;
        let seeds = seed_nodes(&config.kv_seeds, &config.http_seeds)?;

        let shutdown = CancellationToken::new();
        let operations = TaskTracker::new();
        let background = TaskTracker::new();

        let orphans = Arc::new(OrphanReporter::new(config.orphan_log.clone()));
        let pool = Arc::new(KvPool::new(
            config.pool.clone(),
            ConnectSetup {
                bucket: config.bucket.clone(),
                authenticator: authenticator.clone(),
                connect_timeout: config.pool.kv_connect_timeout(),
                max_queue: config.pool.max_queue_size,
                abandon_timeout: config.pool.kv_abandoned_timeout(),
                orphans: orphans.clone(),
            },
        ));
        let http = HttpDispatcher::new(&config.http, authenticator, &config.user_agent)?;
        let topology = Arc::new(TopologyManager::new());
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker.clone()));

        let registry = OperationRegistry::new(RegistryParts {
            topology: topology.clone(),
            breakers: breakers.clone(),
            retry: RetryOrchestrator::new(config.retry.build_strategy()),
            transport: Arc::new(TransportDispatcher::new(
                pool.clone(),
                http.clone(),
                topology.clone(),
            )),
            tracer,
            tasks: operations.clone(),
            shutdown: shutdown.clone(),
        });

        let cccp: Option<Arc<dyn ConfigSource>> = match config.topology.bootstrap {
            BootstrapMode::Http => None,
            _ => Some(Arc::new(CccpPoller::new(pool.clone()))),
        };
        let http_source: Option<Arc<dyn ConfigSource>> = match config.topology.bootstrap {
            BootstrapMode::Cccp => None,
            _ => Some(Arc::new(HttpConfigPoller::new(http, config.bucket.clone()))),
        };
        let refresher = ConfigRefresher::new(
            topology.clone(),
            cccp,
            http_source,
            config.topology.clone(),
            seeds,
        );
        background.spawn(refresher.run(shutdown.clone()));
        background.spawn(orphans.clone().run(shutdown.clone()));
        background.spawn(prune_departed_nodes(
            topology.clone(),
            breakers.clone(),
            pool.clone(),
            shutdown.clone(),
        ));

        let shown = config.redacted();
        info!(
            kv_seeds = ?shown.kv_seeds,
            http_seeds = ?shown.http_seeds,
            bucket = ?shown.bucket,
            bootstrap = ?config.topology.bootstrap,
            "agent started"
        );
        Ok(Agent {
            topology,
            breakers,
            pool,
            registry,
            orphans,
            operations,
            background,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// Submits `request`; `callback` runs exactly once with the outcome.
    pub fn dispatch<F>(&self, request: OperationRequest, callback: F) -> Result<OperationHandle>
    where
        F: FnOnce(Result<OperationResponse>) + Send + 'static,
    {
        self.registry.dispatch(request, callback)
    }

    /// Submits `request` and waits for its outcome. Dropping the future
    /// cancels the operation.
    pub async fn execute(&self, request: OperationRequest) -> Result<OperationResponse> {
        self.registry.execute(request).await
    }

    /// Waits up to `timeout` for the first cluster config.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        self.topology.wait_for_first(timeout).await.map(|_| ())
    }

    /// Latest topology snapshot.
    pub fn topology(&self) -> Option<Arc<TopologySnapshot>> {
        self.topology.current()
    }

    /// Operations accepted but not yet settled.
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    /// Operation tasks still running, including row producers.
    pub fn active_tasks(&self) -> usize {
        self.registry.active_tasks()
    }

    /// KV pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// State of the breaker for `service` on `node`.
    pub fn breaker_state(&self, node: &NodeId, service: ServiceKind) -> CircuitState {
        self.breakers.state(node, service)
    }

    /// Orphaned responses recorded since the last report.
    pub fn orphaned_responses(&self) -> u64 {
        self.orphans.pending()
    }

    /// Settles every pending operation with `Shutdown`, stops background
    /// tasks and drops all connections. Later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let canceled = self.registry.cancel_all(CancelReason::Shutdown);
        self.shutdown.cancel();
        self.operations.close();
        self.background.close();
        self.operations.wait().await;
        self.background.wait().await;
        self.pool.close();
        info!(canceled, "agent closed");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drops breakers and connection pools for nodes absent from each newly
/// published snapshot.
async fn prune_departed_nodes(
    topology: Arc<TopologyManager>,
    breakers: Arc<BreakerRegistry>,
    pool: Arc<KvPool>,
    shutdown: CancellationToken,
) {
    let mut revisions = topology.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = revisions.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let Some(snapshot) = topology.current() else {
            continue;
        };
        let live: Vec<NodeId> = snapshot.nodes().iter().map(|n| n.id.clone()).collect();
        breakers.retain_nodes(&live);
        pool.retain_nodes(&snapshot.addresses(ServiceKind::Kv));
        debug!(revision = %snapshot.revision(), nodes = live.len(), "pruned state for departed nodes");
    }
}
