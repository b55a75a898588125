//! Identity of the database resource under test

use std::collections::BTreeMap;
use std::fmt;

use kube::core::ObjectMeta;

use super::postgres::{Postgres, PostgresSpec, StorageResources, StorageSpec, StorageType};
use crate::config::VerifierConfig;
use crate::error::{Error, Result};

/// Maximum length of a Kubernetes object name used as a label value
const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// `{namespace, name}` of the database custom resource a scenario targets
///
/// Validated on construction and immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterObjectRef {
    namespace: String,
    name: String,
}

impl ClusterObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        validate_label("namespace", &namespace)?;
        validate_label("name", &name)?;
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pod name of the first StatefulSet ordinal
    pub fn ordinal_pod_name(&self, ordinal: u32) -> String {
        format!("{}-{}", self.name, ordinal)
    }
}

impl fmt::Display for ClusterObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends
fn validate_label(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= MAX_LABEL_VALUE_LENGTH
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidReference(format!(
            "{} {:?} is not a valid RFC 1123 label",
            field, value
        )))
    }
}

/// Build a Postgres resource for `reference` using the provisioning settings
pub fn postgres_fixture(
    reference: &ClusterObjectRef,
    config: &VerifierConfig,
    replicas: i32,
    ephemeral: bool,
) -> Postgres {
    let provisioning = &config.provisioning;

    let (storage_type, storage) = if ephemeral {
        (Some(StorageType::Ephemeral), None)
    } else {
        (
            None,
            Some(StorageSpec {
                storage_class_name: Some(provisioning.storage_class.clone()),
                access_modes: vec!["ReadWriteOnce".to_string()],
                resources: StorageResources {
                    requests: BTreeMap::from([(
                        "storage".to_string(),
                        provisioning.storage_size.clone(),
                    )]),
                },
            }),
        )
    };

    Postgres {
        metadata: ObjectMeta {
            name: Some(reference.name().to_string()),
            namespace: Some(reference.namespace().to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                "postgres-e2e".to_string(),
            )])),
            ..Default::default()
        },
        spec: PostgresSpec {
            version: provisioning.version.clone(),
            replicas: Some(replicas),
            storage_type,
            storage,
        },
        status: None,
    }
}
