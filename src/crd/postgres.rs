use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Postgres is the database resource the operator under test reconciles
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "Postgres",
    plural = "postgreses",
    shortname = "pg",
    namespaced,
    status = "PostgresStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresSpec {
    /// Catalog version (e.g., "9.6-v1")
    pub version: String,

    /// Number of Postgres members in the replica set
    /// - 1 = standalone, pod is always `<name>-0`
    /// - 2+ = one primary plus standbys, roles published via labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// `Durable` (default) or `Ephemeral`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<StorageType>,

    /// Volume claim for durable storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum StorageType {
    Durable,
    Ephemeral,
}

/// Subset of a PersistentVolumeClaim spec
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    pub resources: StorageResources,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct StorageResources {
    /// Requested quantities, e.g. `storage: 1Gi`
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

/// Status published by the operator
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostgresStatus {
    #[serde(default)]
    pub phase: DatabasePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Database lifecycle phase
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum DatabasePhase {
    Initializing,
    Creating,
    Running,
    Paused,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabasePhase::Initializing => write!(f, "Initializing"),
            DatabasePhase::Creating => write!(f, "Creating"),
            DatabasePhase::Running => write!(f, "Running"),
            DatabasePhase::Paused => write!(f, "Paused"),
            DatabasePhase::Failed => write!(f, "Failed"),
            DatabasePhase::Unknown => write!(f, "Unknown"),
        }
    }
}

impl Postgres {
    /// Configured replica count, if the resource sets one
    pub fn replicas(&self) -> Option<i32> {
        self.spec.replicas
    }

    /// Current phase, `Unknown` until the operator writes a status
    pub fn phase(&self) -> DatabasePhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }
}
