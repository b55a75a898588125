//! End-to-end convergence verification for replicated PostgreSQL on Kubernetes
//!
//! The [`ScenarioOracle`] answers questions like "does the standby
//! eventually see the three tables created on the primary?" by polling the
//! live cluster: resolve which pod is primary, tunnel to it, run a probe,
//! and repeat until the answer is accepted or the poll times out.

pub mod cluster;
pub mod config;
pub mod crd;
pub mod error;
pub mod oracle;
pub mod poll;
pub mod probe;
pub mod topology;
pub mod tunnel;

pub use cluster::{ClusterApi, KubeCluster};
pub use config::VerifierConfig;
pub use crd::{ClusterObjectRef, DatabasePhase, Postgres, PostgresSpec, postgres_fixture};
pub use error::{ConnectError, Error, QueryError, Result, TopologyError, TunnelError};
pub use oracle::ScenarioOracle;
pub use poll::{Outcome, PollSpec, Termination, eventually, eventually_equals, eventually_true};
pub use probe::{Credentials, ReplicationRecord, ReplicationReport, Session};
pub use topology::{PodRole, RoleSelector, TopologyResolver};
pub use tunnel::{DirectUpstream, PortForwardUpstream, Tunnel, TunnelManager, Upstream};
