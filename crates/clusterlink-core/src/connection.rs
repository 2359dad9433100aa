//! Multiplexed binary protocol connections.
//!
//! Each connection owns a reader task that routes responses to callers by
//! opaque. Callers share the write half behind an async mutex. A caller that
//! gives up after its request was written leaves the opaque registered but
//! abandoned, so the late response is reported as an orphan instead of
//! being mistaken for another request's answer. A connection whose
//! abandoned requests stay unanswered past `abandon_timeout` is poisoned so
//! the pool redials it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::error::CoreError;
use crate::orphan::{OrphanRecord, OrphanReporter};
use crate::protocol::{Frame, FrameError, Opcode, Status};
use crate::retry::{AttemptFailure, RetryReason};
use crate::topology::{Endpoint, ServiceKind};

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Dial or handshake failed or timed out.
    #[error("connect to {addr} failed: {reason}")]
    Connect {
        /// Node address.
        addr: String,
        /// What failed.
        reason: String,
    },

    /// The connection was already unusable; nothing was sent.
    #[error("connection to {0} is closed")]
    Closed(String),

    /// The connection died after the request was written.
    #[error("connection to {0} closed with the request in flight")]
    ClosedInFlight(String),

    /// Writing the request failed.
    #[error("write to {addr} failed: {source}")]
    Write {
        /// Node address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The in-flight cap was reached; nothing was sent.
    #[error("too many requests in flight on {0}")]
    QueueFull(String),

    /// The request or response could not be encoded or decoded.
    #[error("protocol error on {addr}: {reason}")]
    Protocol {
        /// Node address.
        addr: String,
        /// What could not be decoded.
        reason: String,
    },

    /// SASL or bucket selection was refused.
    #[error("authentication against {0} failed")]
    Auth(String),

    /// A handshake step was answered with an unexpected status.
    #[error("{addr} rejected {command} with status {status:?}")]
    Rejected {
        /// Node address.
        addr: String,
        /// Handshake command.
        command: &'static str,
        /// Status the node answered with.
        status: Status,
    },
}

impl ConnError {
    /// Classifies the failure for the retry orchestrator.
    pub fn into_attempt_failure(self) -> AttemptFailure {
        let message = self.to_string();
        match self {
            ConnError::Connect { addr, .. } => AttemptFailure::retryable(
                RetryReason::NodeUnreachable,
                CoreError::transport(&addr, message),
            ),
            ConnError::Closed(addr) => AttemptFailure::retryable(
                RetryReason::SocketNotAvailable,
                CoreError::transport(&addr, message),
            ),
            ConnError::QueueFull(addr) => AttemptFailure::retryable(
                RetryReason::NodeOverloaded,
                CoreError::transport(&addr, message),
            ),
            ConnError::ClosedInFlight(addr) | ConnError::Write { addr, .. } => {
                AttemptFailure::retryable(
                    RetryReason::SocketClosedInFlight,
                    CoreError::transport(&addr, message),
                )
            }
            ConnError::Protocol { .. } => AttemptFailure::retryable(
                RetryReason::MalformedResponse,
                CoreError::protocol(message),
            ),
            ConnError::Auth(addr) => {
                AttemptFailure::fatal(CoreError::AuthenticationFailure { addr })
            }
            ConnError::Rejected { status, .. } => AttemptFailure::fatal(CoreError::ServiceError {
                status: status.as_u16(),
                code: None,
                message,
            }),
        }
    }
}

struct PendingCall {
    tx: Option<oneshot::Sender<Frame>>,
    operation: &'static str,
    sent_at: Instant,
}

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u32, PendingCall>,
    /// Abandoned opaques, oldest first.
    abandoned: VecDeque<(u32, Instant)>,
}

impl PendingCalls {
    /// When the oldest still-unanswered abandoned request was given up on.
    fn oldest_abandoned(&mut self) -> Option<Instant> {
        while let Some(&(opaque, at)) = self.abandoned.front() {
            if self.calls.get(&opaque).is_some_and(|call| call.tx.is_none()) {
                return Some(at);
            }
            self.abandoned.pop_front();
        }
        None
    }

    fn clear(&mut self) {
        self.calls.clear();
        self.abandoned.clear();
    }
}

type PendingMap = Arc<Mutex<PendingCalls>>;

/// Settings applied when dialing a node.
#[derive(Clone)]
pub struct ConnectSetup {
    /// Bucket to select after authenticating.
    pub bucket: Option<String>,
    /// Credential source, consulted once per connection.
    pub authenticator: Arc<dyn Authenticator>,
    /// Bound on TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// In-flight request cap.
    pub max_queue: usize,
    /// How long an abandoned request may stay unanswered before the
    /// connection is considered stuck.
    pub abandon_timeout: Duration,
    /// Destination for orphaned responses.
    pub orphans: Arc<OrphanReporter>,
}

/// A single multiplexed connection to one node.
pub struct KvConnection {
    addr: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    next_opaque: AtomicU32,
    broken: Arc<AtomicBool>,
    max_queue: usize,
    abandon_timeout: Duration,
    reader: JoinHandle<()>,
}

impl KvConnection {
    /// Dials `endpoint`, authenticates and selects the bucket.
    pub async fn connect(endpoint: &Endpoint, setup: &ConnectSetup) -> Result<KvConnection, ConnError> {
        Self::connect_within(endpoint, setup, setup.connect_timeout).await
    }

    /// Like [`KvConnection::connect`], bounded by `timeout` instead of the
    /// configured connect timeout.
    pub async fn connect_within(
        endpoint: &Endpoint,
        setup: &ConnectSetup,
        timeout: Duration,
    ) -> Result<KvConnection, ConnError> {
        let addr = endpoint.address();
        match tokio::time::timeout(timeout, Self::establish(endpoint, setup)).await {
            Ok(result) => result,
            Err(_) => Err(ConnError::Connect {
                addr,
                reason: format!("timed out after {:?}", timeout),
            }),
        }
    }

    async fn establish(endpoint: &Endpoint, setup: &ConnectSetup) -> Result<KvConnection, ConnError> {
        let addr = endpoint.address();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ConnError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let conn = KvConnection::from_halves(
            addr.clone(),
            read_half,
            write_half,
            setup.max_queue,
            setup.abandon_timeout,
            setup.orphans.clone(),
        );

        let credentials = setup
            .authenticator
            .credentials(ServiceKind::Kv, endpoint)
            .map_err(|_| ConnError::Auth(addr.clone()))?;
        if let Some(credentials) = credentials {
            let message = credentials.sasl_plain();
            drop(credentials);
            let request = Frame::request(Opcode::SaslAuth, 0, 0)
                .with_key(Bytes::from_static(b"PLAIN"))
                .with_value(Bytes::copy_from_slice(&message));
            drop(message);
            let response = conn.call(request).await?;
            match response.status() {
                Status::Success => {}
                Status::AuthError => return Err(ConnError::Auth(addr)),
                status => {
                    return Err(ConnError::Rejected {
                        addr,
                        command: Opcode::SaslAuth.name(),
                        status,
                    })
                }
            }
        }

        if let Some(bucket) = &setup.bucket {
            let request = Frame::request(Opcode::SelectBucket, 0, 0)
                .with_key(Bytes::copy_from_slice(bucket.as_bytes()));
            let response = conn.call(request).await?;
            match response.status() {
                Status::Success => {}
                Status::AuthError => return Err(ConnError::Auth(addr)),
                status => {
                    return Err(ConnError::Rejected {
                        addr,
                        command: Opcode::SelectBucket.name(),
                        status,
                    })
                }
            }
        }

        info!(addr = %conn.addr, bucket = ?setup.bucket, "kv connection established");
        Ok(conn)
    }

    /// Wraps an already connected socket and starts its reader task.
    pub fn from_halves(
        addr: String,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        max_queue: usize,
        abandon_timeout: Duration,
        orphans: Arc<OrphanReporter>,
    ) -> KvConnection {
        let pending: PendingMap = Arc::new(Mutex::new(PendingCalls::default()));
        let broken = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            addr.clone(),
            read_half,
            pending.clone(),
            broken.clone(),
            orphans,
        ));
        KvConnection {
            addr,
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_opaque: AtomicU32::new(1),
            broken,
            max_queue: max_queue.max(1),
            abandon_timeout,
            reader,
        }
    }

    /// Peer address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns `true` once the connection can no longer be used.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Number of registered requests, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.lock_pending().calls.len()
    }

    /// Sends `request` and waits for its response.
    ///
    /// Dropping the returned future abandons the request. If the frame was
    /// only partially written the connection is poisoned and discarded.
    pub async fn call(&self, mut request: Frame) -> Result<Frame, ConnError> {
        if self.is_broken() {
            return Err(ConnError::Closed(self.addr.clone()));
        }
        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        request.opaque = opaque;
        let operation = request.opcode().map(|op| op.name()).unwrap_or("unknown");
        let encoded = request.to_bytes().map_err(|e| ConnError::Protocol {
            addr: self.addr.clone(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            let stuck = pending
                .oldest_abandoned()
                .is_some_and(|at| at.elapsed() >= self.abandon_timeout);
            if stuck {
                drop(pending);
                warn!(
                    addr = %self.addr,
                    timeout = ?self.abandon_timeout,
                    "abandoned kv request never answered"
                );
                self.mark_broken();
                return Err(ConnError::Closed(self.addr.clone()));
            }
            if pending.calls.len() >= self.max_queue {
                return Err(ConnError::QueueFull(self.addr.clone()));
            }
            pending.calls.insert(
                opaque,
                PendingCall {
                    tx: Some(tx),
                    operation,
                    sent_at: Instant::now(),
                },
            );
        }
        let mut guard = CallGuard {
            conn: self,
            opaque,
            writing: false,
            written: false,
            done: false,
        };
        // The reader marks the connection broken before clearing the map,
        // so a registration that raced with the teardown is caught here.
        if self.is_broken() {
            return Err(ConnError::Closed(self.addr.clone()));
        }

        {
            let mut writer = self.writer.lock().await;
            guard.writing = true;
            if let Err(source) = writer.write_all(&encoded).await {
                self.mark_broken();
                return Err(ConnError::Write {
                    addr: self.addr.clone(),
                    source,
                });
            }
            guard.writing = false;
        }
        guard.written = true;

        let response = rx.await;
        guard.done = true;
        response.map_err(|_| ConnError::ClosedInFlight(self.addr.clone()))
    }

    fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            warn!(addr = %self.addr, "kv connection marked broken");
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for KvConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for KvConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConnection")
            .field("addr", &self.addr)
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// Cleans up a call's registration when its future is dropped early.
struct CallGuard<'a> {
    conn: &'a KvConnection,
    opaque: u32,
    writing: bool,
    written: bool,
    done: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.writing {
            self.conn.mark_broken();
        }
        let mut pending = self.conn.lock_pending();
        if self.written {
            if let Some(call) = pending.calls.get_mut(&self.opaque) {
                call.tx = None;
                pending.abandoned.push_back((self.opaque, Instant::now()));
            }
        } else {
            pending.calls.remove(&self.opaque);
        }
    }
}

async fn read_loop(
    addr: String,
    read_half: OwnedReadHalf,
    pending: PendingMap,
    broken: Arc<AtomicBool>,
    orphans: Arc<OrphanReporter>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let frame = match Frame::read_from(&mut reader).await {
            Ok(frame) => frame,
            Err(err) => {
                match &err {
                    FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!(addr = %addr, "kv connection closed by peer");
                    }
                    _ => warn!(addr = %addr, error = %err, "kv connection reader failed"),
                }
                broken.store(true, Ordering::Release);
                pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
                return;
            }
        };

        let call = pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .remove(&frame.opaque);
        match call {
            Some(PendingCall { tx: Some(tx), .. }) => {
                let _ = tx.send(frame);
            }
            Some(PendingCall {
                tx: None,
                operation,
                sent_at,
            }) => orphans.record(OrphanRecord {
                operation: operation.to_string(),
                opaque: frame.opaque,
                remote: addr.clone(),
                payload_size: frame.body_len(),
                elapsed_us: sent_at.elapsed().as_micros() as u64,
            }),
            None => {
                debug!(addr = %addr, opaque = frame.opaque, "response for unknown opaque");
            }
        }
    }
}
