//! Operation requests and responses.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use reqwest::Method;
use tokio_util::sync::CancellationToken;

use crate::deadline::Deadline;
use crate::error::{CoreError, Result};
use crate::protocol::{Opcode, Status, MAX_KEY_LEN};
use crate::retry::RetryStrategy;
use crate::rows::RowReader;
use crate::topology::ServiceKind;

/// A binary protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvCommand {
    /// Command opcode.
    pub opcode: Opcode,
    /// Document key.
    pub key: Bytes,
    /// Command extras.
    pub extras: Bytes,
    /// Document value.
    pub value: Bytes,
    /// Expected CAS, or 0.
    pub cas: u64,
    /// Datatype flags of `value`.
    pub datatype: u8,
}

impl KvCommand {
    fn new(opcode: Opcode, key: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            key: key.into(),
            extras: Bytes::new(),
            value: Bytes::new(),
            cas: 0,
            datatype: 0,
        }
    }

    fn store(opcode: Opcode, key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Self {
        let mut extras = BytesMut::with_capacity(8);
        extras.put_u32(flags);
        extras.put_u32(expiry);
        Self {
            extras: extras.freeze(),
            value: value.into(),
            ..Self::new(opcode, key)
        }
    }

    /// Fetches a document.
    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Get, key)
    }

    /// Stores a document unconditionally.
    pub fn upsert(key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Self {
        Self::store(Opcode::Set, key, value, flags, expiry)
    }

    /// Stores a document that must not exist yet.
    pub fn insert(key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Self {
        Self::store(Opcode::Add, key, value, flags, expiry)
    }

    /// Replaces an existing document, optionally guarded by `cas`.
    pub fn replace(key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32, cas: u64) -> Self {
        Self {
            cas,
            ..Self::store(Opcode::Replace, key, value, flags, expiry)
        }
    }

    /// Removes a document, optionally guarded by `cas`.
    pub fn remove(key: impl Into<Bytes>, cas: u64) -> Self {
        Self {
            cas,
            ..Self::new(Opcode::Delete, key)
        }
    }

    /// Liveness probe against any KV node.
    pub fn noop() -> Self {
        Self::new(Opcode::Noop, Bytes::new())
    }

    fn requires_key(&self) -> bool {
        !matches!(self.opcode, Opcode::Noop | Opcode::GetClusterConfig)
    }
}

/// An HTTP request to a query-style or management service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCommand {
    /// HTTP method.
    pub method: Method,
    /// Path and query, starting with `/`.
    pub path: String,
    /// Request body.
    pub body: Bytes,
    /// Content type of `body`.
    pub content_type: Option<String>,
}

impl HttpCommand {
    /// A `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: Bytes::new(),
            content_type: None,
        }
    }

    /// A `POST` request with a JSON body.
    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: body.into(),
            content_type: Some("application/json".to_string()),
        }
    }
}

/// Service-specific request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Binary protocol command.
    Kv(KvCommand),
    /// HTTP request.
    Http(HttpCommand),
}

/// Immutable description of one logical call.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    name: String,
    service: ServiceKind,
    payload: Payload,
    deadline: Deadline,
    idempotent: bool,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
    cancel: Option<CancellationToken>,
    wait_for_topology: bool,
}

impl OperationRequest {
    /// Creates a request. Requests are non-idempotent unless marked.
    pub fn new(service: ServiceKind, payload: Payload, deadline: Deadline) -> Self {
        let name = match &payload {
            Payload::Kv(cmd) => cmd.opcode.name().to_string(),
            Payload::Http(_) => service.as_str().to_string(),
        };
        Self {
            name,
            service,
            payload,
            deadline,
            idempotent: false,
            retry_strategy: None,
            cancel: None,
            wait_for_topology: false,
        }
    }

    /// A binary protocol request.
    pub fn kv(command: KvCommand, deadline: Deadline) -> Self {
        Self::new(ServiceKind::Kv, Payload::Kv(command), deadline)
    }

    /// An HTTP request to `service`.
    pub fn http(service: ServiceKind, command: HttpCommand, deadline: Deadline) -> Self {
        Self::new(service, Payload::Http(command), deadline)
    }

    /// Marks whether the operation may be repeated safely.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Overrides the process-wide retry strategy.
    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    /// Ties the operation to an external cancellation token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Waits (within the deadline) for a first topology instead of failing
    /// with `TopologyUnavailable`.
    pub fn wait_for_topology(mut self, wait: bool) -> Self {
        self.wait_for_topology = wait;
        self
    }

    /// Overrides the span and log name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Span and log name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target service.
    pub fn service(&self) -> ServiceKind {
        self.service
    }

    /// Payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Absolute deadline.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Whether retries are safe after the request may have taken effect.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Per-request retry strategy.
    pub fn retry_strategy(&self) -> Option<&Arc<dyn RetryStrategy>> {
        self.retry_strategy.as_ref()
    }

    /// External cancellation token.
    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Whether dispatch may wait for the first topology.
    pub fn waits_for_topology(&self) -> bool {
        self.wait_for_topology
    }

    /// Routing key of a KV request.
    pub fn routing_key(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Kv(cmd) if !cmd.key.is_empty() => Some(&cmd.key),
            _ => None,
        }
    }

    /// Structural checks run before the request is accepted.
    pub fn validate(&self) -> Result<()> {
        match (&self.payload, self.service) {
            (Payload::Kv(cmd), ServiceKind::Kv) => {
                if matches!(cmd.opcode, Opcode::SaslAuth | Opcode::SelectBucket) {
                    return Err(CoreError::config(format!(
                        "{} is managed by the connection",
                        cmd.opcode.name()
                    )));
                }
                if cmd.requires_key() && cmd.key.is_empty() {
                    return Err(CoreError::config("document key must not be empty"));
                }
                if cmd.key.len() > MAX_KEY_LEN {
                    return Err(CoreError::config(format!(
                        "document key of {} bytes exceeds {}",
                        cmd.key.len(),
                        MAX_KEY_LEN
                    )));
                }
                Ok(())
            }
            (Payload::Http(cmd), service) if service != ServiceKind::Kv => {
                if !cmd.path.starts_with('/') {
                    return Err(CoreError::config(format!(
                        "request path {:?} must start with '/'",
                        cmd.path
                    )));
                }
                Ok(())
            }
            (_, service) => Err(CoreError::config(format!(
                "payload does not match the {} service",
                service
            ))),
        }
    }
}

/// Decoded binary protocol response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvResponse {
    /// Response status; non-success statuses that are not retried are
    /// returned to the caller as-is.
    pub status: Status,
    /// Document CAS.
    pub cas: u64,
    /// Response extras (e.g. document flags).
    pub extras: Bytes,
    /// Document key, when echoed.
    pub key: Bytes,
    /// Document value.
    pub value: Bytes,
    /// Datatype flags of `value`.
    pub datatype: u8,
}

/// Fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

/// Result of a successful operation.
pub enum OperationResponse {
    /// Binary protocol response.
    Kv(KvResponse),
    /// Streamed rows of a query-style response.
    Rows(RowReader),
    /// Raw HTTP response.
    Http(HttpResponse),
}

impl OperationResponse {
    /// The KV response, if this is one.
    pub fn into_kv(self) -> Option<KvResponse> {
        match self {
            OperationResponse::Kv(resp) => Some(resp),
            _ => None,
        }
    }

    /// The row reader, if this is one.
    pub fn into_rows(self) -> Option<RowReader> {
        match self {
            OperationResponse::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// The raw HTTP response, if this is one.
    pub fn into_http(self) -> Option<HttpResponse> {
        match self {
            OperationResponse::Http(resp) => Some(resp),
            _ => None,
        }
    }
}

impl fmt::Debug for OperationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResponse::Kv(resp) => f.debug_tuple("Kv").field(resp).finish(),
            OperationResponse::Rows(_) => f.write_str("Rows(..)"),
            OperationResponse::Http(resp) => f.debug_tuple("Http").field(resp).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::new(Duration::from_secs(1))
    }

    #[test]
    fn test_defaults() {
        let req = OperationRequest::kv(KvCommand::get(&b"k"[..]), deadline());
        assert!(!req.is_idempotent());
        assert!(!req.waits_for_topology());
        assert!(req.retry_strategy().is_none());
        assert_eq!(req.name(), "get");
        assert_eq!(req.routing_key(), Some(&b"k"[..]));
        req.validate().unwrap();
    }

    #[test]
    fn test_store_extras() {
        let cmd = KvCommand::upsert(&b"k"[..], &b"{}"[..], 0x0200_0006, 60);
        assert_eq!(&cmd.extras[..], &[0x02, 0, 0, 0x06, 0, 0, 0, 60]);
        let cmd = KvCommand::replace(&b"k"[..], &b"{}"[..], 0, 0, 99);
        assert_eq!(cmd.cas, 99);
        assert_eq!(cmd.opcode, Opcode::Replace);
    }

    #[test]
    fn test_reject_long_key() {
        let key = vec![b'a'; MAX_KEY_LEN + 1];
        let req = OperationRequest::kv(KvCommand::get(key), deadline());
        assert_eq!(req.validate().unwrap_err().kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_reject_empty_key() {
        let req = OperationRequest::kv(KvCommand::get(Bytes::new()), deadline());
        assert!(req.validate().is_err());
        let noop = OperationRequest::kv(KvCommand::noop(), deadline());
        noop.validate().unwrap();
        assert_eq!(noop.routing_key(), None);
    }

    #[test]
    fn test_reject_payload_mismatch() {
        let req = OperationRequest::new(
            ServiceKind::Query,
            Payload::Kv(KvCommand::get(&b"k"[..])),
            deadline(),
        );
        assert!(req.validate().is_err());
        let req = OperationRequest::new(ServiceKind::Kv, Payload::Http(HttpCommand::get("/")), deadline());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_reject_relative_path() {
        let req = OperationRequest::http(
            ServiceKind::Management,
            HttpCommand::get("pools/default"),
            deadline(),
        );
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_reject_connection_commands() {
        let mut cmd = KvCommand::noop();
        cmd.opcode = Opcode::SelectBucket;
        let req = OperationRequest::kv(cmd, deadline());
        assert!(req.validate().is_err());
    }
}
