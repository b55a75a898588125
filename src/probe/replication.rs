//! Streaming replication status

/// State a healthy standby connection reports
pub const STREAMING: &str = "streaming";

/// One row of `pg_stat_replication`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationRecord {
    pub application_name: String,
    pub state: String,
}

impl ReplicationRecord {
    pub fn new(application_name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            state: state.into(),
        }
    }
}

/// Verdict over every replication connection seen on a primary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Number of replication connections reported
    pub total: usize,
    /// Connections that are streaming and belong to the resource
    pub streaming: usize,
    /// Application names of connections that are not (yet) healthy
    pub lagging: Vec<String>,
}

impl ReplicationReport {
    /// A record counts only when it is streaming and its application name
    /// starts with `prefix` (the resource name).
    pub fn evaluate(records: &[ReplicationRecord], prefix: &str) -> Self {
        let lagging: Vec<String> = records
            .iter()
            .filter(|r| r.state != STREAMING || !r.application_name.starts_with(prefix))
            .map(|r| r.application_name.clone())
            .collect();

        Self {
            total: records.len(),
            streaming: records.len() - lagging.len(),
            lagging,
        }
    }

    /// Every reported connection is a streaming standby of the resource
    pub fn all_streaming(&self) -> bool {
        self.lagging.is_empty()
    }

    /// All streaming, and exactly `expected` connections
    pub fn converged(&self, expected: usize) -> bool {
        self.all_streaming() && self.total == expected
    }
}
