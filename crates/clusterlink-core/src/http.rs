//! HTTP attempts for the query-style and management services.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::Authenticator;
use crate::dispatcher::AttemptContext;
use crate::error::{CoreError, Result};
use crate::request::{HttpResponse, OperationRequest, OperationResponse, Payload};
use crate::retry::{AttemptFailure, RetryReason};
use crate::rows::{RowReader, StreamParams};
use crate::topology::{ServiceKind, Target};

/// Query error codes that mean a prepared statement must be re-prepared.
const PREPARED_STATEMENT_CODES: [u64; 3] = [4040, 4050, 4070];
/// Analytics error codes for transient server conditions.
const ANALYTICS_TEMPORARY_CODES: [u64; 3] = [23000, 23003, 23007];
/// Bytes of a failed response's body read for classification.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Idle connections kept across all hosts; 0 means no overall cap.
    pub max_idle_connections: usize,
    /// Idle connections kept per host (default: 100).
    pub max_idle_connections_per_host: usize,
    /// How long an idle connection is kept (default: 4.5s).
    pub idle_timeout_ms: u64,
    /// Rows buffered between the body decoder and the reader (default: 64).
    pub row_buffer_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: 0,
            max_idle_connections_per_host: 100,
            idle_timeout_ms: 4_500,
            row_buffer_size: 64,
        }
    }
}

impl HttpConfig {
    /// Idle connection timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Effective per-host idle limit. The client pools per host only, so an
    /// overall cap lowers the per-host limit.
    pub fn effective_idle_per_host(&self) -> usize {
        match self.max_idle_connections {
            0 => self.max_idle_connections_per_host,
            total => self.max_idle_connections_per_host.min(total),
        }
    }
}

/// Sends HTTP attempts and classifies their responses.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    authenticator: Arc<dyn Authenticator>,
    row_buffer: usize,
}

impl HttpDispatcher {
    /// Builds the client.
    pub fn new(
        config: &HttpConfig,
        authenticator: Arc<dyn Authenticator>,
        user_agent: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.effective_idle_per_host())
            .pool_idle_timeout(config.idle_timeout())
            .user_agent(user_agent)
            .build()
            .map_err(|e| CoreError::config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            authenticator,
            row_buffer: config.row_buffer_size,
        })
    }

    /// Sends a GET to `path` on `target` and returns the full body.
    ///
    /// Used by the config poller outside the operation lifecycle.
    pub async fn fetch(&self, target: &Target, path: &str) -> Result<Bytes> {
        let addr = target.endpoint.address();
        let mut builder = self.client.get(format!("http://{}{}", addr, path));
        if let Some(creds) = self
            .authenticator
            .credentials(target.service, &target.endpoint)?
        {
            builder = builder.basic_auth(creds.username(), Some(creds.password()));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::transport(&addr, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| CoreError::transport(&addr, e))?;
        if status != 200 {
            return Err(CoreError::ServiceError {
                status,
                code: None,
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }

    /// Performs one attempt.
    pub(crate) async fn execute(
        &self,
        target: &Target,
        request: &OperationRequest,
        ctx: &AttemptContext,
    ) -> std::result::Result<OperationResponse, AttemptFailure> {
        let Payload::Http(cmd) = request.payload() else {
            return Err(AttemptFailure::fatal(CoreError::config(
                "http services require an http payload",
            )));
        };
        let addr = target.endpoint.address();
        let url = format!("http://{}{}", addr, cmd.path);
        let mut builder = self
            .client
            .request(cmd.method.clone(), &url)
            .body(cmd.body.clone());
        if let Some(content_type) = &cmd.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.as_str());
        }
        let creds = self
            .authenticator
            .credentials(target.service, &target.endpoint)
            .map_err(AttemptFailure::fatal)?;
        if let Some(creds) = creds {
            builder = builder.basic_auth(creds.username(), Some(creds.password()));
        }

        let response = builder.send().await.map_err(|e| {
            let reason = if e.is_connect() {
                RetryReason::NodeUnreachable
            } else {
                RetryReason::SocketClosedInFlight
            };
            AttemptFailure::retryable(reason, CoreError::transport(&addr, e))
        })?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = read_capped(response.bytes_stream(), ERROR_BODY_LIMIT)
                .await
                .map_err(|e| {
                    AttemptFailure::retryable(
                        RetryReason::SocketClosedInFlight,
                        CoreError::transport(&addr, e),
                    )
                })?;
            debug!(addr = %addr, status, service = %target.service, "http request failed");
            return Err(classify_http_failure(target.service, status, &body, &addr));
        }

        match target.service.row_field() {
            Some(field) => {
                let params = StreamParams {
                    field,
                    deadline: ctx.deadline,
                    buffer: self.row_buffer,
                    attempts: ctx.attempt,
                    addr,
                    shutdown: ctx.shutdown.clone(),
                };
                Ok(OperationResponse::Rows(RowReader::spawn(
                    response.bytes_stream(),
                    params,
                    &ctx.tasks,
                )))
            }
            None => {
                let body = response.bytes().await.map_err(|e| {
                    AttemptFailure::retryable(
                        RetryReason::SocketClosedInFlight,
                        CoreError::transport(&addr, e),
                    )
                })?;
                Ok(OperationResponse::Http(HttpResponse { status, body }))
            }
        }
    }
}

/// Reads at most `limit` bytes of `body`; the rest is never pulled off the
/// connection.
async fn read_capped<S, E>(body: S, limit: usize) -> std::result::Result<Bytes, E>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
{
    let mut body = Box::pin(body);
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let room = limit - buf.len();
        if chunk.len() >= room {
            buf.extend_from_slice(&chunk[..room]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Classifies a non-200 response from `service`.
pub(crate) fn classify_http_failure(
    service: ServiceKind,
    status: u16,
    body: &[u8],
    addr: &str,
) -> AttemptFailure {
    let (code, message) = first_error(body);
    let error = CoreError::ServiceError {
        status,
        code: code.map(|c| c as u32),
        message: message.unwrap_or_else(|| String::from_utf8_lossy(body).into_owned()),
    };
    let has_code = |codes: &[u64]| {
        error_codes(body)
            .iter()
            .any(|code| codes.contains(code))
    };

    match status {
        401 | 403 => AttemptFailure::fatal(CoreError::AuthenticationFailure {
            addr: addr.to_string(),
        }),
        429 => AttemptFailure::retryable(RetryReason::NodeOverloaded, error),
        503 => AttemptFailure::retryable(RetryReason::ServiceTemporarilyUnavailable, error),
        _ if service == ServiceKind::Query && has_code(&PREPARED_STATEMENT_CODES) => {
            AttemptFailure::retryable(RetryReason::PreparedStatementFailure, error)
        }
        _ if service == ServiceKind::Analytics && has_code(&ANALYTICS_TEMPORARY_CODES) => {
            AttemptFailure::retryable(RetryReason::ServiceTemporarilyUnavailable, error)
        }
        _ => AttemptFailure::fatal(error),
    }
}

fn error_codes(body: &[u8]) -> Vec<u64> {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    parsed
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("code").and_then(Value::as_u64))
                .collect()
        })
        .unwrap_or_default()
}

fn first_error(body: &[u8]) -> (Option<u64>, Option<String>) {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return (None, None);
    };
    let Some(first) = parsed
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
    else {
        return (None, None);
    };
    (
        first.get("code").and_then(Value::as_u64),
        first
            .get("msg")
            .and_then(Value::as_str)
            .map(str::to_string),
    )
}
