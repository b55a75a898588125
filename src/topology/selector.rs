//! Typed label selectors for replica-set roles

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;

use crate::config::LabelConfig;

/// Role a pod plays in the replica set, read from its role label
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PodRole {
    Primary,
    Standby,
    Unknown,
}

impl PodRole {
    /// Value the operator writes to the role label, `None` for `Unknown`
    pub fn label_value(self, labels: &LabelConfig) -> Option<&str> {
        match self {
            PodRole::Primary => Some(labels.primary_value.as_str()),
            PodRole::Standby => Some(labels.standby_value.as_str()),
            PodRole::Unknown => None,
        }
    }

    /// Classify a pod from its labels
    pub fn of_pod(pod: &Pod, labels: &LabelConfig) -> Self {
        let value = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&labels.role_key));

        match value {
            Some(v) if *v == labels.primary_value => PodRole::Primary,
            Some(v) if *v == labels.standby_value => PodRole::Standby,
            _ => PodRole::Unknown,
        }
    }
}

impl fmt::Display for PodRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodRole::Primary => write!(f, "primary"),
            PodRole::Standby => write!(f, "standby"),
            PodRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// Equality-based label selector for the pods of one database resource
///
/// Always carries the resource's ownership labels; `with_role` narrows it
/// to one role. Rendering is deterministic (keys sorted).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleSelector {
    match_labels: BTreeMap<String, String>,
}

impl RoleSelector {
    /// Selector matching every pod owned by `resource_name`
    pub fn for_resource(resource_name: &str, labels: &LabelConfig) -> Self {
        let mut match_labels = BTreeMap::new();
        match_labels.insert(labels.name_key.clone(), resource_name.to_string());
        if !labels.kind_key.is_empty() {
            match_labels.insert(labels.kind_key.clone(), labels.kind_value.clone());
        }
        Self { match_labels }
    }

    /// Narrow to pods labeled with `role`; `Unknown` leaves the selector as is
    pub fn with_role(mut self, role: PodRole, labels: &LabelConfig) -> Self {
        if let Some(value) = role.label_value(labels) {
            self.match_labels
                .insert(labels.role_key.clone(), value.to_string());
        }
        self
    }

    pub fn match_labels(&self) -> &BTreeMap<String, String> {
        &self.match_labels
    }

    /// Whether a label set satisfies every term of the selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for RoleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", terms.join(","))
    }
}
