//! Error types for the clusterlink core.

use thiserror::Error;

/// Payload-free classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller or internal cancellation won the settlement race.
    RequestCanceled,
    /// The deadline elapsed before settlement.
    Timeout,
    /// The target was rejected by its circuit breaker.
    CircuitOpen,
    /// No topology snapshot has been obtained yet.
    TopologyUnavailable,
    /// No node in the topology offers the requested service.
    ServiceNotAvailable,
    /// Connection-level failure.
    TransportFailure,
    /// Malformed or truncated response.
    ProtocolFailure,
    /// Error reported by the server in a well-formed response.
    ServiceError,
    /// Credentials were rejected.
    AuthenticationFailure,
    /// Invalid input, rejected at submission.
    ConfigurationError,
    /// The peer does not implement the requested feature.
    Unsupported,
    /// The agent was closed while the operation was pending.
    Shutdown,
}

/// Errors surfaced by the core, either synchronously at submission or
/// exactly once through an operation's settlement callback.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// Caller or internal cancellation won the settlement race.
    #[error("request canceled")]
    RequestCanceled,

    /// The deadline elapsed before settlement.
    #[error("operation timed out after {attempts} attempt(s)")]
    Timeout {
        /// Attempts started before the deadline.
        attempts: u32,
    },

    /// The target's breaker rejected the attempt.
    #[error("circuit breaker open for {service} on {node}")]
    CircuitOpen {
        /// Rejected node.
        node: String,
        /// Service on that node.
        service: String,
    },

    /// No snapshot yet and the request did not opt into waiting.
    #[error("no cluster topology available yet")]
    TopologyUnavailable,

    /// No node in the topology advertises the service.
    #[error("no node offers the {service} service")]
    ServiceNotAvailable {
        /// Requested service.
        service: String,
    },

    /// Connection-level error, including I/O errors.
    #[error("transport failure talking to {addr}: {reason}")]
    TransportFailure {
        /// Peer address.
        addr: String,
        /// What went wrong.
        reason: String,
    },

    /// Malformed or truncated response.
    #[error("protocol failure: {reason}")]
    ProtocolFailure {
        /// What could not be decoded.
        reason: String,
    },

    /// The server answered with an error.
    #[error("service error (status {status}): {message}")]
    ServiceError {
        /// HTTP status or binary protocol status code.
        status: u16,
        /// Service-specific error code from the body, if any.
        code: Option<u32>,
        /// Server-supplied message.
        message: String,
    },

    /// Credentials were rejected.
    #[error("authentication failed against {addr}")]
    AuthenticationFailure {
        /// Node that rejected them.
        addr: String,
    },

    /// Invalid input, rejected before the operation was accepted.
    #[error("invalid configuration: {reason}")]
    ConfigurationError {
        /// What is wrong with it.
        reason: String,
    },

    /// The peer does not implement the requested feature.
    #[error("unsupported: {what}")]
    Unsupported {
        /// The missing feature.
        what: String,
    },

    /// The agent closed while the operation was pending.
    #[error("agent shut down")]
    Shutdown,
}

impl CoreError {
    /// Returns the payload-free kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::RequestCanceled => ErrorKind::RequestCanceled,
            CoreError::Timeout { .. } => ErrorKind::Timeout,
            CoreError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CoreError::TopologyUnavailable => ErrorKind::TopologyUnavailable,
            CoreError::ServiceNotAvailable { .. } => ErrorKind::ServiceNotAvailable,
            CoreError::TransportFailure { .. } => ErrorKind::TransportFailure,
            CoreError::ProtocolFailure { .. } => ErrorKind::ProtocolFailure,
            CoreError::ServiceError { .. } => ErrorKind::ServiceError,
            CoreError::AuthenticationFailure { .. } => ErrorKind::AuthenticationFailure,
            CoreError::ConfigurationError { .. } => ErrorKind::ConfigurationError,
            CoreError::Unsupported { .. } => ErrorKind::Unsupported,
            CoreError::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        CoreError::ConfigurationError {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        CoreError::ProtocolFailure {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(addr: &str, reason: impl std::fmt::Display) -> Self {
        CoreError::TransportFailure {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
