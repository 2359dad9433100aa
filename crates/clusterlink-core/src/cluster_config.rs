//! Parsing of the cluster's JSON configuration into a [`TopologySnapshot`].

use std::collections::HashMap;

use serde::Deserialize;
use tracing::trace;

use crate::error::{CoreError, Result};
use crate::topology::{NodeInfo, Revision, ServiceKind, TopologySnapshot, VbucketMap};

const HOST_PLACEHOLDER: &str = "$HOST";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    rev: i64,
    #[serde(default)]
    rev_epoch: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    nodes_ext: Vec<RawNode>,
    #[serde(default, rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawVbucketServerMap>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVbucketServerMap {
    #[serde(default)]
    server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

fn resolve_host(raw: Option<&str>, source_host: &str) -> String {
    match raw {
        None | Some("") | Some(HOST_PLACEHOLDER) => source_host.to_string(),
        Some(host) => host.to_string(),
    }
}

impl TopologySnapshot {
    /// Parses a cluster config document received from `source_host`.
    ///
    /// Hostnames reported as `$HOST` or left empty refer to the node that
    /// served the document.
    pub fn from_config_json(bytes: &[u8], source_host: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::protocol(format!("invalid cluster config: {}", e)))?;
        if raw.nodes_ext.is_empty() {
            return Err(CoreError::protocol("cluster config lists no nodes"));
        }

        let nodes: Vec<NodeInfo> = raw
            .nodes_ext
            .iter()
            .map(|node| {
                let host = resolve_host(node.hostname.as_deref(), source_host);
                let services = node.services.iter().filter_map(|(key, port)| {
                    ServiceKind::from_config_key(key).map(|service| (service, *port))
                });
                NodeInfo::new(host, services)
            })
            .collect();

        let mut snapshot =
            TopologySnapshot::new(Revision::new(raw.rev_epoch, raw.rev), nodes);
        if let Some(name) = raw.name {
            snapshot = snapshot.with_bucket(name);
        }
        if let Some(map) = raw.vbucket_server_map {
            let servers = map
                .server_list
                .into_iter()
                .map(|server| server.replace(HOST_PLACEHOLDER, source_host))
                .collect();
            snapshot = snapshot.with_vbucket_map(VbucketMap::new(servers, map.vbucket_map));
        }
        trace!(revision = %snapshot.revision(), "parsed cluster config");
        Ok(snapshot)
    }
}
