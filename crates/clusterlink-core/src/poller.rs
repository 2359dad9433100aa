//! Background topology refresh.
//!
//! The refresh loop walks the known nodes, fetching the cluster config from
//! one node per round. The binary source is preferred; a node answering
//! that it does not implement the config command moves the loop to the HTTP
//! source for good (in `Both` mode). Every successful fetch is offered to
//! the [`TopologyManager`], which keeps only newer revisions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::http::HttpDispatcher;
use crate::pool::KvPool;
use crate::protocol::{Frame, Opcode, Status};
use crate::topology::{
    BootstrapMode, NodeInfo, ServiceKind, Target, TopologyConfig, TopologyManager,
    TopologySnapshot,
};

/// Fetches a cluster config from one node.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Fetches and parses the config as seen by `node`.
    async fn fetch(&self, node: &NodeInfo) -> Result<TopologySnapshot>;
}

/// Binary config source: `GetClusterConfig` over a pooled KV connection.
pub struct CccpPoller {
    pool: Arc<KvPool>,
}

impl CccpPoller {
    /// Creates the source.
    pub fn new(pool: Arc<KvPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigSource for CccpPoller {
    fn name(&self) -> &'static str {
        "cccp"
    }

    async fn fetch(&self, node: &NodeInfo) -> Result<TopologySnapshot> {
        let endpoint = node
            .endpoint(ServiceKind::Kv)
            .ok_or_else(|| CoreError::ServiceNotAvailable {
                service: ServiceKind::Kv.to_string(),
            })?;
        let conn = self
            .pool
            .checkout(&endpoint, None)
            .await
            .map_err(|e| e.into_attempt_failure().error)?;
        let response = conn
            .call(Frame::request(Opcode::GetClusterConfig, 0, 0))
            .await
            .map_err(|e| e.into_attempt_failure().error)?;
        match response.status() {
            Status::Success => TopologySnapshot::from_config_json(&response.value, &endpoint.host),
            Status::UnknownCommand | Status::NotSupported => Err(CoreError::Unsupported {
                what: Opcode::GetClusterConfig.name().to_string(),
            }),
            status => Err(CoreError::ServiceError {
                status: status.as_u16(),
                code: None,
                message: String::from_utf8_lossy(&response.value).into_owned(),
            }),
        }
    }
}

/// HTTP config source on the management port.
pub struct HttpConfigPoller {
    http: HttpDispatcher,
    bucket: Option<String>,
}

impl HttpConfigPoller {
    /// Creates the source; `bucket` selects the bucket config endpoint.
    pub fn new(http: HttpDispatcher, bucket: Option<String>) -> Self {
        Self { http, bucket }
    }

    fn path(&self) -> String {
        match &self.bucket {
            Some(bucket) => format!("/pools/default/b/{}", bucket),
            None => "/pools/default/nodeServices".to_string(),
        }
    }
}

#[async_trait]
impl ConfigSource for HttpConfigPoller {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, node: &NodeInfo) -> Result<TopologySnapshot> {
        let endpoint = node
            .endpoint(ServiceKind::Management)
            .ok_or_else(|| CoreError::ServiceNotAvailable {
                service: ServiceKind::Management.to_string(),
            })?;
        let target = Target {
            node: node.id.clone(),
            endpoint: endpoint.clone(),
            service: ServiceKind::Management,
            vbucket: None,
        };
        let body = self.http.fetch(&target, &self.path()).await?;
        TopologySnapshot::from_config_json(&body, &endpoint.host)
    }
}

/// Periodically refreshes the topology until shut down.
pub struct ConfigRefresher {
    topology: Arc<TopologyManager>,
    cccp: Option<Arc<dyn ConfigSource>>,
    http: Option<Arc<dyn ConfigSource>>,
    config: TopologyConfig,
    seeds: Vec<NodeInfo>,
}

impl ConfigRefresher {
    /// Creates the loop. `seeds` are polled until a first snapshot exists.
    pub fn new(
        topology: Arc<TopologyManager>,
        cccp: Option<Arc<dyn ConfigSource>>,
        http: Option<Arc<dyn ConfigSource>>,
        config: TopologyConfig,
        seeds: Vec<NodeInfo>,
    ) -> Self {
        Self {
            topology,
            cccp,
            http,
            config,
            seeds,
        }
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        match self.topology.current() {
            Some(snapshot) if !snapshot.nodes().is_empty() => snapshot.nodes().to_vec(),
            _ => self.seeds.clone(),
        }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut use_http = self.cccp.is_none() || self.config.bootstrap == BootstrapMode::Http;
        let mut cursor = 0usize;
        let mut http_node_since: Option<Instant> = None;

        loop {
            let nodes = self.nodes();
            let source = if use_http { self.http.as_ref() } else { self.cccp.as_ref() };
            let Some(source) = source.filter(|_| !nodes.is_empty()) else {
                warn!("no config source or node to poll");
                if !sleep_or_shutdown(self.config.poll_interval(), &shutdown).await {
                    return;
                }
                continue;
            };

            let node = &nodes[cursor % nodes.len()];
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => return,
                fetched = tokio::time::timeout(self.config.poll_timeout(), source.fetch(node)) => fetched,
            };
            let fetched = fetched.unwrap_or_else(|_| {
                Err(CoreError::Timeout { attempts: 1 })
            });

            let delay = match fetched {
                Ok(snapshot) => {
                    let revision = snapshot.revision();
                    if self.topology.publish(snapshot) {
                        info!(source = source.name(), node = %node.id, %revision, "applied cluster config");
                    } else {
                        debug!(source = source.name(), node = %node.id, %revision, "config not newer");
                    }
                    if use_http {
                        // The HTTP source stays on one node for the redial
                        // period before moving on.
                        let since = *http_node_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= self.config.http_redial_period() {
                            cursor += 1;
                            http_node_since = None;
                        }
                    } else {
                        cursor += 1;
                    }
                    self.config.poll_interval()
                }
                Err(CoreError::Unsupported { what })
                    if !use_http && self.config.bootstrap == BootstrapMode::Both && self.http.is_some() =>
                {
                    info!(node = %node.id, %what, "binary config unsupported, switching to http polling");
                    use_http = true;
                    Duration::ZERO
                }
                Err(e) => {
                    warn!(source = source.name(), node = %node.id, error = %e, "config fetch failed");
                    cursor += 1;
                    http_node_since = None;
                    if use_http {
                        self.config.http_retry_delay()
                    } else {
                        self.config.poll_interval()
                    }
                }
            };

            if !delay.is_zero() && !sleep_or_shutdown(delay, &shutdown).await {
                return;
            }
        }
    }
}

/// Sleeps for `delay`; returns `false` if shut down first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Builds bootstrap nodes from `host:port` seed strings, merging KV and
/// management seeds that share a host.
pub fn seed_nodes(kv_seeds: &[String], http_seeds: &[String]) -> Result<Vec<NodeInfo>> {
    let mut merged: Vec<(String, Vec<(ServiceKind, u16)>)> = Vec::new();
    let seeds = kv_seeds
        .iter()
        .map(|s| (s, ServiceKind::Kv))
        .chain(http_seeds.iter().map(|s| (s, ServiceKind::Management)));
    for (seed, service) in seeds {
        let (host, port) = parse_host_port(seed)?;
        match merged.iter_mut().find(|(h, _)| *h == host) {
            Some((_, services)) => services.push((service, port)),
            None => merged.push((host, vec![(service, port)])),
        }
    }
    Ok(merged
        .into_iter()
        .map(|(host, services)| NodeInfo::new(host, services))
        .collect())
}

fn parse_host_port(seed: &str) -> Result<(String, u16)> {
    let (host, port) = seed
        .rsplit_once(':')
        .ok_or_else(|| CoreError::config(format!("seed '{}' is not host:port", seed)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| CoreError::config(format!("seed '{}' has an invalid port", seed)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CoreError::config(format!("seed '{}' has an empty host", seed)));
    }
    Ok((host.to_string(), port))
}
