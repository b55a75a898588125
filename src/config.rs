//! Verifier configuration
//!
//! A single immutable [`VerifierConfig`] is built once per test run and
//! shared (`Arc`) by every component. It can be built from defaults,
//! `E2E_*` environment variables, or a YAML document.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::poll::PollSpec;
use crate::probe::sql::CONNECT_TIMEOUT_SECS;

/// Attempt budget for polls that open one database session
const SESSION_ATTEMPT_SECS: u64 = CONNECT_TIMEOUT_SECS + 5;

/// Database connection defaults for probes
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// PostgreSQL port inside the pod
    pub port: u16,
    /// Database to connect to
    pub database: String,
    /// Role to connect as
    pub user: String,
    /// Schema holding ephemeral test tables
    pub schema: String,
    /// Table receiving sample rows
    pub rows_table: String,
    /// Suffix of the secret holding the superuser password (`<name><suffix>`)
    pub auth_secret_suffix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            schema: "data".to_string(),
            rows_table: "kubedb_table".to_string(),
            auth_secret_suffix: "-auth".to_string(),
        }
    }
}

/// Label keys and values the operator puts on database pods
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LabelConfig {
    pub role_key: String,
    pub primary_value: String,
    pub standby_value: String,
    pub name_key: String,
    pub kind_key: String,
    pub kind_value: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            role_key: "kubedb.com/role".to_string(),
            primary_value: "primary".to_string(),
            standby_value: "replica".to_string(),
            name_key: "kubedb.com/name".to_string(),
            kind_key: "kubedb.com/kind".to_string(),
            kind_value: "Postgres".to_string(),
        }
    }
}

/// Poll schedule per scenario kind
///
/// Polls that open a database session get an attempt budget above
/// [`CONNECT_TIMEOUT_SECS`], so a stalled connect fails on its own before
/// the attempt is cut off. Table creation and row insertion run many
/// statements per attempt and get a minute. Polls that only read the
/// Kubernetes API keep a budget of one interval. A spec given in YAML
/// without `attemptTimeout` also falls back to one interval.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PollingConfig {
    pub replication: PollSpec,
    pub schema: PollSpec,
    pub tables: PollSpec,
    pub count: PollSpec,
    pub ping: PollSpec,
    pub insert: PollSpec,
    pub health: PollSpec,
    pub running: PollSpec,
    pub pod_ready: PollSpec,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let secs = Duration::from_secs;
        let mins = |m: u64| Duration::from_secs(m * 60);
        let session = secs(SESSION_ATTEMPT_SECS);
        let batch = mins(1);
        Self {
            replication: PollSpec::new(secs(5), mins(10)).with_attempt_timeout(session),
            schema: PollSpec::new(secs(5), mins(5)).with_attempt_timeout(session),
            tables: PollSpec::new(secs(5), mins(5)).with_attempt_timeout(batch),
            count: PollSpec::new(secs(5), mins(10)).with_attempt_timeout(session),
            ping: PollSpec::new(secs(5), mins(10)).with_attempt_timeout(session),
            insert: PollSpec::new(secs(10), mins(10)).with_attempt_timeout(batch),
            health: PollSpec::new(secs(5), mins(1)).with_attempt_timeout(session),
            running: PollSpec::new(secs(5), mins(15)),
            pod_ready: PollSpec::new(secs(5), mins(20)),
        }
    }
}

/// Settings used when building database resources for scenarios
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisioningConfig {
    /// Catalog version of the database resource
    pub version: String,
    /// Storage class for durable storage
    pub storage_class: String,
    /// Requested volume size
    pub storage_size: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            version: "9.6-v1".to_string(),
            storage_class: "standard".to_string(),
            storage_size: "1Gi".to_string(),
        }
    }
}

/// Complete verifier configuration
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct VerifierConfig {
    pub database: DatabaseConfig,
    pub labels: LabelConfig,
    pub polling: PollingConfig,
    pub provisioning: ProvisioningConfig,
}

impl VerifierConfig {
    /// Parse a YAML document; missing fields keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `E2E_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `E2E_*` key
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("E2E_DB_PORT") {
            config.database.port = v
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("E2E_DB_PORT: {:?}", v)))?;
        }
        if let Some(v) = lookup("E2E_DB_NAME") {
            config.database.database = v;
        }
        if let Some(v) = lookup("E2E_DB_USER") {
            config.database.user = v;
        }
        if let Some(v) = lookup("E2E_DB_SCHEMA") {
            config.database.schema = v;
        }
        if let Some(v) = lookup("E2E_IMAGE_VERSION") {
            config.provisioning.version = v;
        }
        if let Some(v) = lookup("E2E_STORAGE_CLASS") {
            config.provisioning.storage_class = v;
        }

        // A global retry schedule applies to the pod readiness poll
        let interval = lookup("E2E_RETRY_INTERVAL_SECS")
            .map(|v| parse_secs("E2E_RETRY_INTERVAL_SECS", &v))
            .transpose()?;
        let timeout = lookup("E2E_TIMEOUT_SECS")
            .map(|v| parse_secs("E2E_TIMEOUT_SECS", &v))
            .transpose()?;
        if interval.is_some() || timeout.is_some() {
            let current = config.polling.pod_ready;
            config.polling.pod_ready = PollSpec::new(
                interval.unwrap_or(current.interval),
                timeout.unwrap_or(current.timeout),
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no scenario could run with
    pub fn validate(&self) -> Result<()> {
        if self.database.port == 0 {
            return Err(Error::InvalidConfig("database port must be non-zero".into()));
        }
        for (field, value) in [
            ("database.database", &self.database.database),
            ("database.user", &self.database.user),
            ("database.schema", &self.database.schema),
            ("database.rowsTable", &self.database.rows_table),
            ("labels.roleKey", &self.labels.role_key),
            ("labels.primaryValue", &self.labels.primary_value),
            ("labels.standbyValue", &self.labels.standby_value),
            ("labels.nameKey", &self.labels.name_key),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("{} must not be empty", field)));
            }
        }
        if self.labels.primary_value == self.labels.standby_value {
            return Err(Error::InvalidConfig(
                "primary and standby role values must differ".into(),
            ));
        }

        let p = &self.polling;
        for (kind, spec) in [
            ("replication", &p.replication),
            ("schema", &p.schema),
            ("tables", &p.tables),
            ("count", &p.count),
            ("ping", &p.ping),
            ("insert", &p.insert),
            ("health", &p.health),
            ("running", &p.running),
            ("podReady", &p.pod_ready),
        ] {
            spec.validate()
                .map_err(|e| Error::InvalidConfig(format!("polling.{}: {}", kind, e)))?;
        }
        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::InvalidConfig(format!("{}: {:?}", key, value)))
}
