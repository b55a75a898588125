//! Error types for the convergence-verification engine
//!
//! Every failure a poll attempt can observe is an [`Error`]. The poller
//! consults [`Error::is_transient`] to decide whether an attempt failure
//! means "not yet converged" or aborts the poll.

use std::time::Duration;

use thiserror::Error;

/// Failures while mapping role labels to pod identities
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("no pod labeled {selector} in namespace {namespace}")]
    NoMatch { namespace: String, selector: String },

    #[error("expected exactly one pod labeled {selector}, found {count}: {pods:?}")]
    Ambiguous {
        selector: String,
        count: usize,
        pods: Vec<String>,
    },

    #[error("pod matched by {0} has no name")]
    UnnamedPod(String),
}

/// Failures while setting up or tearing down a forwarded channel
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("pod {namespace}/{pod} does not exist")]
    PodNotFound { namespace: String, pod: String },

    #[error("failed to bind local listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("forwarding handshake to {pod}:{port} failed: {reason}")]
    Handshake {
        pod: String,
        port: u16,
        reason: String,
    },

    #[error("forwarding task failed during teardown: {0}")]
    Teardown(String),
}

/// Failures while establishing or using a database connection
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("malformed connection parameter {field}: {value:?}")]
    Malformed { field: &'static str, value: String },

    #[error("connection to 127.0.0.1:{port} failed: {source}")]
    Refused {
        port: u16,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("connection lost: {0}")]
    Lost(#[source] tokio_postgres::Error),
}

/// A statement the server rejected
#[derive(Error, Debug)]
#[error("statement rejected (SQLSTATE {code}): {message}")]
pub struct QueryError {
    pub code: String,
    pub message: String,
}

/// Error variants are named after the component that raised them so a
/// failed scenario points at the layer that failed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error(
        "{step} did not converge within {elapsed:?} (last value: {last_value}, last error: {})",
        last_error.as_deref().unwrap_or("none")
    )]
    ConvergenceTimeout {
        step: String,
        last_value: String,
        last_error: Option<String>,
        elapsed: Duration,
    },

    #[error("attempt exceeded its {0:?} budget")]
    AttemptTimeout(Duration),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid cluster object reference: {0}")]
    InvalidReference(String),
}

impl Error {
    /// Whether a poll attempt that failed with this error may be retried.
    ///
    /// Target-system transients (pods not scheduled, connections refused,
    /// statements failing while the server starts) are retried. Topology
    /// violations and configuration mistakes abort.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Topology(_) => false,
            Error::Tunnel(_) => true,
            Error::Connect(ConnectError::Malformed { .. }) => false,
            Error::Connect(_) => true,
            Error::HealthCheck(_) => true,
            Error::Query(_) => true,
            Error::AttemptTimeout(_) => true,
            Error::ConvergenceTimeout { .. } => false,
            Error::Kube(kube::Error::Api(api_err)) => {
                // 4xx other than NotFound, Conflict and TooManyRequests will not heal
                let code = api_err.code;
                if (400..500).contains(&code) {
                    return matches!(code, 404 | 409 | 429);
                }
                true
            }
            Error::Kube(_) => true,
            Error::InvalidConfig(_) => false,
            Error::InvalidReference(_) => false,
        }
    }

    /// True when a Kubernetes lookup came back 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
            || matches!(self, Error::Tunnel(TunnelError::PodNotFound { .. }))
    }
}

/// Split a driver error into "the server rejected the statement" and
/// "the connection is unusable".
///
/// Statement failures carry a SQLSTATE; everything else is treated as a
/// connectivity problem so the caller reconnects (and re-resolves
/// topology) on the next attempt.
pub fn classify_postgres_error(err: tokio_postgres::Error) -> Error {
    match err.as_db_error() {
        Some(db) => Error::Query(QueryError {
            code: db.code().code().to_string(),
            message: db.message().to_string(),
        }),
        None => Error::Connect(ConnectError::Lost(err)),
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
