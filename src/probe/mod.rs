//! Database probes
//!
//! A [`Session`] is one `tokio-postgres` connection through a [`Tunnel`].
//! Sessions are opened per poll attempt and never pooled.

mod credentials;
pub mod names;
mod replication;
pub mod sql;

pub use credentials::{Credentials, PASSWORD_KEY, USER_KEY};
pub use replication::{ReplicationRecord, ReplicationReport, STREAMING};

use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

use crate::error::{ConnectError, Error, Result, classify_postgres_error};
use crate::tunnel::Tunnel;

/// An open database connection through a tunnel
pub struct Session {
    client: Client,
    connection: JoinHandle<()>,
    local_port: u16,
}

impl Session {
    /// Connect through `tunnel` with `credentials`
    pub async fn connect(tunnel: &Tunnel, credentials: &Credentials) -> Result<Self> {
        Self::connect_port(tunnel.local_port(), credentials).await
    }

    /// Connect to `127.0.0.1:<local_port>`
    pub async fn connect_port(local_port: u16, credentials: &Credentials) -> Result<Self> {
        let config = sql::connection_string(local_port, credentials)?;

        let (client, connection) = tokio_postgres::connect(&config, NoTls)
            .await
            .map_err(|source| ConnectError::Refused {
                port: local_port,
                source,
            })?;

        // The connection future drives the socket until the client is dropped
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::trace!(error = %e, "PostgreSQL connection closed");
            }
        });

        tracing::debug!(
            local_port = local_port,
            user = %credentials.user,
            database = %credentials.database,
            "Database session opened"
        );

        Ok(Self {
            client,
            connection,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Round-trip `SELECT 1`
    pub async fn ping(&self) -> Result<()> {
        if self.client.is_closed() {
            return Err(Error::HealthCheck("connection is closed".into()));
        }
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| Error::HealthCheck(e.to_string()))?;
        Ok(())
    }

    /// Run one statement and return the number of rows it affected
    pub async fn execute(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.client
            .execute(statement, params)
            .await
            .map_err(classify_postgres_error)
    }

    /// Run one or more `;`-separated statements without parameters
    pub async fn batch_execute(&self, statements: &str) -> Result<()> {
        self.client
            .batch_execute(statements)
            .await
            .map_err(classify_postgres_error)
    }

    /// Replication connections reported by `pg_stat_replication`
    pub async fn replication_status(&self) -> Result<Vec<ReplicationRecord>> {
        let rows = self
            .client
            .query(sql::REPLICATION_STATUS, &[])
            .await
            .map_err(classify_postgres_error)?;

        rows.iter()
            .map(|row| {
                let application_name: Option<String> =
                    row.try_get(0).map_err(classify_postgres_error)?;
                let state: Option<String> = row.try_get(1).map_err(classify_postgres_error)?;
                Ok(ReplicationRecord::new(
                    application_name.unwrap_or_default(),
                    state.unwrap_or_default(),
                ))
            })
            .collect()
    }

    /// Number of tables in `schema`
    pub async fn count_tables(&self, schema: &str) -> Result<i64> {
        self.query_count(sql::COUNT_TABLES, &[&schema]).await
    }

    /// Number of rows in `table`
    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        self.query_count(&sql::count_rows(table), &[]).await
    }

    /// Whether the server is a standby replaying WAL
    pub async fn is_in_recovery(&self) -> Result<bool> {
        let row = self
            .client
            .query_one(sql::IS_IN_RECOVERY, &[])
            .await
            .map_err(classify_postgres_error)?;
        row.try_get(0).map_err(classify_postgres_error)
    }

    /// Drop the client and wait for the connection task to finish
    pub async fn close(self) {
        let Self {
            client, connection, ..
        } = self;
        drop(client);
        if let Err(e) = connection.await {
            tracing::trace!(error = %e, "PostgreSQL connection task ended abnormally");
        }
    }

    async fn query_count(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<i64> {
        let row = self
            .client
            .query_one(statement, params)
            .await
            .map_err(classify_postgres_error)?;
        row.try_get(0).map_err(classify_postgres_error)
    }
}
