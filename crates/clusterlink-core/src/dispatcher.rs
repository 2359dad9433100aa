//! Binding attempts to concrete connections.
//!
//! The registry hands each attempt to a [`Transport`]. The production
//! implementation, [`TransportDispatcher`], sends KV commands over pooled
//! binary connections and everything else through the HTTP dispatcher,
//! translating protocol-level outcomes into [`AttemptFailure`]s.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::connection::ConnError;
use crate::deadline::Deadline;
use crate::error::CoreError;
use crate::http::HttpDispatcher;
use crate::pool::KvPool;
use crate::protocol::{Frame, Status};
use crate::request::{KvResponse, OperationRequest, OperationResponse, Payload};
use crate::retry::{AttemptFailure, RetryReason};
use crate::topology::{ServiceKind, Target, TopologyManager, TopologySnapshot};

/// Per-attempt context passed to the transport.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Operation id.
    pub op_id: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Operation deadline.
    pub deadline: Deadline,
    /// Tracker for tasks that outlive the attempt (row producers).
    pub tasks: TaskTracker,
    /// Fires when the agent shuts down.
    pub shutdown: CancellationToken,
}

/// Performs one attempt against a chosen target.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` to `target`.
    ///
    /// The returned future may be dropped at any await point when the
    /// operation is canceled or times out; implementations must release
    /// their resources on drop.
    async fn execute(
        &self,
        target: &Target,
        request: &OperationRequest,
        ctx: &AttemptContext,
    ) -> Result<OperationResponse, AttemptFailure>;
}

/// Routes KV attempts to the pool and HTTP attempts to the HTTP client.
pub struct TransportDispatcher {
    kv: Arc<KvPool>,
    http: HttpDispatcher,
    topology: Arc<TopologyManager>,
}

impl TransportDispatcher {
    /// Creates the dispatcher.
    pub fn new(kv: Arc<KvPool>, http: HttpDispatcher, topology: Arc<TopologyManager>) -> Self {
        Self { kv, http, topology }
    }

    async fn execute_kv(
        &self,
        target: &Target,
        request: &OperationRequest,
    ) -> Result<OperationResponse, AttemptFailure> {
        let Payload::Kv(cmd) = request.payload() else {
            return Err(AttemptFailure::fatal(CoreError::config(
                "kv service requires a kv payload",
            )));
        };
        let conn = self
            .kv
            .checkout(&target.endpoint, Some(request.deadline()))
            .await
            .map_err(ConnError::into_attempt_failure)?;
        let frame = Frame::request(cmd.opcode, target.vbucket.unwrap_or(0), 0)
            .with_key(cmd.key.clone())
            .with_extras(cmd.extras.clone())
            .with_value(cmd.value.clone())
            .with_cas(cmd.cas)
            .with_datatype(cmd.datatype);
        let response = conn
            .call(frame)
            .await
            .map_err(ConnError::into_attempt_failure)?;
        classify_kv_response(&self.topology, target, response)
    }
}

#[async_trait]
impl Transport for TransportDispatcher {
    async fn execute(
        &self,
        target: &Target,
        request: &OperationRequest,
        ctx: &AttemptContext,
    ) -> Result<OperationResponse, AttemptFailure> {
        debug!(
            op_id = ctx.op_id,
            attempt = ctx.attempt,
            node = %target.node,
            service = %target.service,
            "dispatching attempt"
        );
        let result = match target.service {
            ServiceKind::Kv => self.execute_kv(target, request).await,
            _ => self.http.execute(target, request, ctx).await,
        };
        result.map_err(|failure| failure.on_node(target.node.clone()))
    }
}

/// Maps a KV response status to a result or a classified failure.
///
/// A not-my-vbucket response carrying a newer config publishes it before
/// the attempt is retried.
pub(crate) fn classify_kv_response(
    topology: &TopologyManager,
    target: &Target,
    frame: Frame,
) -> Result<OperationResponse, AttemptFailure> {
    let status = frame.status();
    let addr = target.endpoint.address();
    let server_error = |message: &str| CoreError::ServiceError {
        status: status.as_u16(),
        code: None,
        message: message.to_string(),
    };
    match status {
        Status::NotMyVbucket => {
            if !frame.value.is_empty() {
                match TopologySnapshot::from_config_json(&frame.value, &target.endpoint.host) {
                    Ok(snapshot) => {
                        if topology.publish(snapshot) {
                            info!(addr = %addr, "applied config from not-my-vbucket response");
                        }
                    }
                    Err(e) => debug!(addr = %addr, error = %e, "ignoring config in not-my-vbucket response"),
                }
            }
            Err(AttemptFailure::retryable(
                RetryReason::TopologyStale,
                server_error("not my vbucket"),
            ))
        }
        Status::TmpFail | Status::Busy => Err(AttemptFailure::retryable(
            RetryReason::NodeOverloaded,
            server_error("temporary failure"),
        )),
        Status::Locked | Status::SyncWriteInProgress => Err(AttemptFailure::retryable(
            RetryReason::ConflictingWriteInProgress,
            server_error("document locked or write in progress"),
        )),
        Status::AuthError => Err(AttemptFailure::fatal(CoreError::AuthenticationFailure {
            addr,
        })),
        Status::UnknownCommand | Status::NotSupported => {
            let what = frame
                .opcode()
                .map(|op| op.name().to_string())
                .unwrap_or_else(|| format!("opcode 0x{:02x}", frame.opcode));
            Err(AttemptFailure::fatal(CoreError::Unsupported { what }))
        }
        _ => Ok(OperationResponse::Kv(KvResponse {
            status,
            cas: frame.cas,
            extras: frame.extras,
            key: frame.key,
            value: frame.value,
            datatype: frame.datatype,
        })),
    }
}
