//! Scenario oracle
//!
//! Named verification operations against one database resource. Each
//! operation is a poll whose attempts resolve topology, open a tunnel and
//! session, probe, then close the session and tunnel on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::config::VerifierConfig;
use crate::crd::{ClusterObjectRef, DatabasePhase, Postgres, postgres_fixture};
use crate::error::{Error, Result};
use crate::poll::{Outcome, eventually, eventually_equals, eventually_true};
use crate::probe::{Credentials, ReplicationReport, Session, names, sql};
use crate::topology::TopologyResolver;
use crate::tunnel::{Tunnel, TunnelManager};

/// Pod status reported when the pod does not exist
pub const POD_MISSING: &str = "Missing";

/// Pod status reported while the pod is being deleted
pub const POD_TERMINATING: &str = "Terminating";

/// Verification operations for one database resource
#[derive(Clone)]
pub struct ScenarioOracle {
    cluster: Arc<dyn ClusterApi>,
    resolver: TopologyResolver,
    tunnels: TunnelManager,
    config: Arc<VerifierConfig>,
    reference: ClusterObjectRef,
}

impl ScenarioOracle {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: Arc<VerifierConfig>,
        reference: ClusterObjectRef,
    ) -> Self {
        Self {
            resolver: TopologyResolver::new(cluster.clone(), config.clone()),
            tunnels: TunnelManager::new(cluster.clone()),
            cluster,
            config,
            reference,
        }
    }

    pub fn reference(&self) -> &ClusterObjectRef {
        &self.reference
    }

    pub fn resolver(&self) -> &TopologyResolver {
        &self.resolver
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Create the database resource from the provisioning settings
    pub async fn create_database(&self, replicas: i32, ephemeral: bool) -> Result<Postgres> {
        let postgres = postgres_fixture(&self.reference, &self.config, replicas, ephemeral);
        info!(resource = %self.reference, replicas, ephemeral, "Creating database resource");
        self.cluster.create_database(&postgres).await
    }

    /// Delete the database resource; a missing resource is not an error
    pub async fn delete_database(&self) -> Result<()> {
        info!(resource = %self.reference, "Deleting database resource");
        self.cluster.delete_database(&self.reference).await
    }

    /// Drop and recreate the test schema on the primary
    pub async fn create_schema(&self) -> Outcome<bool> {
        let spec = self.config.polling.schema;
        eventually_true("create schema", spec, || self.create_schema_attempt()).await
    }

    /// Create `total` uniquely named tables in the test schema on the primary.
    ///
    /// Tables confirmed in earlier attempts are not created again.
    pub async fn create_tables(&self, total: usize) -> Outcome<bool> {
        let spec = self.config.polling.tables;
        let created = AtomicUsize::new(0);
        eventually_true("create tables", spec, || {
            self.create_tables_attempt(total, &created)
        })
        .await
    }

    /// Wait until `pod` reports exactly `expected` tables in the test schema
    pub async fn count_tables(&self, pod: &str, expected: i64) -> Outcome<i64> {
        let spec = self.config.polling.count;
        let step = format!("count tables on {}", pod);
        eventually_equals(&step, spec, expected, || self.count_tables_attempt(Some(pod))).await
    }

    /// Same as [`count_tables`](Self::count_tables) on whichever pod is primary
    pub async fn count_tables_from_primary(&self, expected: i64) -> Outcome<i64> {
        let spec = self.config.polling.count;
        eventually_equals("count tables on primary", spec, expected, || {
            self.count_tables_attempt(None)
        })
        .await
    }

    /// Wait until `pod` accepts a session and answers `SELECT 1`
    pub async fn ping_database(&self, pod: &str) -> Outcome<bool> {
        let spec = self.config.polling.ping;
        let step = format!("ping {}", pod);
        eventually_true(&step, spec, || self.ping_attempt(pod)).await
    }

    /// Wait until `pod` reports exactly `expected` streaming standbys of this resource
    pub async fn check_streaming_replication(
        &self,
        pod: &str,
        expected: usize,
    ) -> Outcome<ReplicationReport> {
        let spec = self.config.polling.replication;
        let step = format!("streaming replication on {}", pod);
        eventually(
            &step,
            spec,
            || self.replication_attempt(pod),
            |report: &ReplicationReport| report.converged(expected),
        )
        .await
    }

    /// Insert `total` sample rows on the primary.
    ///
    /// The rows table is emptied first, so a later count sees exactly
    /// `total`. Rows confirmed in earlier attempts are not inserted again.
    pub async fn insert_rows(&self, total: usize) -> Outcome<bool> {
        let spec = self.config.polling.insert;
        let inserted = AtomicUsize::new(0);
        eventually_true("insert rows", spec, || {
            self.insert_rows_attempt(total, &inserted)
        })
        .await
    }

    /// Wait until `pod` holds exactly `expected` sample rows
    pub async fn count_rows(&self, pod: &str, expected: i64) -> Outcome<i64> {
        let spec = self.config.polling.count;
        let step = format!("count rows on {}", pod);
        eventually_equals(&step, spec, expected, || self.count_rows_attempt(pod)).await
    }

    /// Wait until the resource reports phase `Running`
    pub async fn wait_for_running(&self) -> Outcome<DatabasePhase> {
        let spec = self.config.polling.running;
        eventually(
            "database running",
            spec,
            || async { Ok::<_, Error>(self.cluster.get_database(&self.reference).await?.phase()) },
            |phase| *phase == DatabasePhase::Running,
        )
        .await
    }

    /// Wait until `pod` exists, is not terminating and reports phase `Running`
    pub async fn wait_for_pod_running(&self, pod: &str) -> Outcome<String> {
        let spec = self.config.polling.pod_ready;
        let step = format!("pod {} running", pod);
        eventually(
            &step,
            spec,
            || self.pod_status(pod),
            |status: &String| status == "Running",
        )
        .await
    }

    /// Delete the current primary pod to trigger a failover; returns its name
    pub async fn delete_primary_pod(&self) -> Result<String> {
        let primary = self.resolver.primary_pod_name(&self.reference).await?;
        info!(resource = %self.reference, pod = %primary, "Deleting primary pod");
        self.cluster
            .delete_pod(self.reference.namespace(), &primary)
            .await?;
        Ok(primary)
    }

    /// Wait until the pod labeled primary reports it is not in recovery
    pub async fn check_primary_role(&self) -> Outcome<bool> {
        let spec = self.config.polling.health;
        eventually_true("primary role", spec, || self.primary_role_attempt()).await
    }

    async fn create_schema_attempt(&self) -> Result<bool> {
        let primary = self.resolver.primary_pod_name(&self.reference).await?;
        // The session user owns the schema, whoever the secret names
        let credentials = self.credentials().await?;
        let statement = sql::recreate_schema(&self.config.database.schema, &credentials.user);

        let (tunnel, session) = self.open_session_as(&primary, &credentials).await?;
        let result: Result<_> = async {
            session.ping().await?;
            session.batch_execute(&statement).await?;
            Ok(true)
        }
        .await;
        finish(tunnel, session, result).await
    }

    async fn create_tables_attempt(&self, total: usize, created: &AtomicUsize) -> Result<bool> {
        let primary = self.resolver.primary_pod_name(&self.reference).await?;
        let schema = &self.config.database.schema;

        let (tunnel, session) = self.open_session(&primary).await?;
        let result: Result<_> = async {
            session.ping().await?;
            while created.load(Ordering::SeqCst) < total {
                let table = names::table_name();
                session.batch_execute(&sql::create_table(schema, &table)).await?;
                let done = created.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(pod = %primary, table = %table, done, total, "Created table");
            }
            Ok(true)
        }
        .await;
        finish(tunnel, session, result).await
    }

    async fn count_tables_attempt(&self, pod: Option<&str>) -> Result<i64> {
        let pod = match pod {
            Some(p) => p.to_string(),
            None => self.resolver.primary_pod_name(&self.reference).await?,
        };
        let schema = &self.config.database.schema;

        let (tunnel, session) = self.open_session(&pod).await?;
        let result: Result<_> = async {
            session.ping().await?;
            session.count_tables(schema).await
        }
        .await;
        finish(tunnel, session, result).await
    }

    async fn ping_attempt(&self, pod: &str) -> Result<bool> {
        let (tunnel, session) = self.open_session(pod).await?;
        let result = session.ping().await.map(|()| true);
        finish(tunnel, session, result).await
    }

    async fn replication_attempt(&self, pod: &str) -> Result<ReplicationReport> {
        let (tunnel, session) = self.open_session(pod).await?;
        let result: Result<_> = async {
            session.ping().await?;
            let records = session.replication_status().await?;
            Ok(ReplicationReport::evaluate(&records, self.reference.name()))
        }
        .await;
        finish(tunnel, session, result).await
    }

    async fn insert_rows_attempt(&self, total: usize, inserted: &AtomicUsize) -> Result<bool> {
        let primary = self.resolver.primary_pod_name(&self.reference).await?;
        let table = &self.config.database.rows_table;
        let insert = sql::insert_row(table);

        let (tunnel, session) = self.open_session(&primary).await?;
        let result: Result<_> = async {
            session.ping().await?;
            // Start from an empty table unless earlier attempts confirmed rows
            let prepare = if inserted.load(Ordering::SeqCst) == 0 {
                sql::recreate_rows_table(table)
            } else {
                sql::create_rows_table(table)
            };
            session.batch_execute(&prepare).await?;
            loop {
                let i = inserted.load(Ordering::SeqCst);
                if i >= total {
                    break;
                }
                let name = format!("KubedbName-{}", i);
                let (int_value, float_value) = {
                    let mut rng = rand::rng();
                    (rng.random_range(0..i64::MAX), rng.random::<f64>())
                };
                session
                    .execute(&insert, &[&name, &int_value, &float_value])
                    .await?;
                inserted.fetch_add(1, Ordering::SeqCst);
            }
            debug!(pod = %primary, total, "Inserted rows");
            Ok(true)
        }
        .await;
        finish(tunnel, session, result).await
    }

    async fn count_rows_attempt(&self, pod: &str) -> Result<i64> {
        let table = &self.config.database.rows_table;
        let (tunnel, session) = self.open_session(pod).await?;
        let result: Result<_> = async {
            session.ping().await?;
            session.count_rows(table).await
        }
        .await;
        finish(tunnel, session, result).await
    }

    async fn primary_role_attempt(&self) -> Result<bool> {
        let primary = self.resolver.primary_pod_name(&self.reference).await?;
        let (tunnel, session) = self.open_session(&primary).await?;
        let result: Result<_> = async {
            session.ping().await?;
            let in_recovery = session.is_in_recovery().await?;
            debug!(pod = %primary, in_recovery, "Checked primary recovery state");
            Ok(!in_recovery)
        }
        .await;
        finish(tunnel, session, result).await
    }

    async fn pod_status(&self, pod: &str) -> Result<String> {
        let found = self.cluster.get_pod(self.reference.namespace(), pod).await?;
        let Some(found) = found else {
            return Ok(POD_MISSING.to_string());
        };
        if found.metadata.deletion_timestamp.is_some() {
            return Ok(POD_TERMINATING.to_string());
        }
        Ok(found
            .status
            .and_then(|s| s.phase)
            .unwrap_or_else(|| "Unknown".to_string()))
    }

    /// Credentials from the resource's auth secret, or the configured user
    /// without a password when there is no such secret
    async fn credentials(&self) -> Result<Credentials> {
        let db = &self.config.database;
        let secret_name = format!("{}{}", self.reference.name(), db.auth_secret_suffix);
        match self
            .cluster
            .get_secret(self.reference.namespace(), &secret_name)
            .await?
        {
            Some(secret) => Credentials::from_secret(&secret, db),
            None => Ok(Credentials::from_config(db)),
        }
    }

    async fn open_session(&self, pod: &str) -> Result<(Tunnel, Session)> {
        let credentials = self.credentials().await?;
        self.open_session_as(pod, &credentials).await
    }

    /// Tunnel and session to `pod`; the tunnel is closed if connecting fails
    async fn open_session_as(
        &self,
        pod: &str,
        credentials: &Credentials,
    ) -> Result<(Tunnel, Session)> {
        let mut tunnel = self
            .tunnels
            .open(&self.reference, pod, self.config.database.port)
            .await?;

        match Session::connect(&tunnel, credentials).await {
            Ok(session) => Ok((tunnel, session)),
            Err(e) => {
                close_tunnel(&mut tunnel).await;
                Err(e)
            }
        }
    }
}

/// Close the session, then the tunnel, and hand back the attempt's result
async fn finish<T>(mut tunnel: Tunnel, session: Session, result: Result<T>) -> Result<T> {
    session.close().await;
    close_tunnel(&mut tunnel).await;
    result
}

async fn close_tunnel(tunnel: &mut Tunnel) {
    if let Err(e) = tunnel.close().await {
        warn!(local_port = tunnel.local_port(), error = %e, "Tunnel teardown failed");
    }
}
