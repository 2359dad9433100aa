#![warn(missing_docs)]

//! clusterlink core: operation lifecycle, topology-aware routing, retries and
//! circuit breaking for a clustered document database client

pub mod agent;
pub mod auth;
pub mod cancel;
pub mod circuitbreaker;
mod cluster_config;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod orphan;
pub mod poller;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod retry;
pub mod rows;
pub mod topology;
pub mod tracer;

pub use agent::Agent;
pub use auth::{Authenticator, Credentials, NoAuthenticator, PasswordAuthenticator};
pub use cancel::{CancelReason, OperationHandle};
pub use config::CoreConfig;
pub use deadline::Deadline;
pub use error::{CoreError, ErrorKind, Result};
pub use request::{
    HttpCommand, HttpResponse, KvCommand, KvResponse, OperationRequest, OperationResponse,
};
pub use retry::{RetryReason, RetryStrategy};
pub use rows::{QueryMetadata, RowReader};
pub use topology::{NodeId, ServiceKind};
pub use tracer::{LoggingTracer, NoopTracer, RequestTracer};
