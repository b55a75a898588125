//! Topology resolution
//!
//! Maps replica-set roles to concrete pod names. Every call is a fresh
//! snapshot of the cluster: a leader hand-off between two calls can make
//! them disagree, and retrying is the caller's business.

mod selector;

pub use selector::{PodRole, RoleSelector};

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::cluster::ClusterApi;
use crate::config::VerifierConfig;
use crate::crd::ClusterObjectRef;
use crate::error::{Error, Result, TopologyError};

/// Resolves which pod plays which role for a database resource
#[derive(Clone)]
pub struct TopologyResolver {
    cluster: Arc<dyn ClusterApi>,
    config: Arc<VerifierConfig>,
}

impl TopologyResolver {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: Arc<VerifierConfig>) -> Self {
        Self { cluster, config }
    }

    /// Name of the single pod labeled primary.
    ///
    /// A standalone resource (one replica) always runs as `<name>-0`, so no
    /// label query is made. Otherwise exactly one pod must carry the primary
    /// label.
    pub async fn primary_pod_name(&self, reference: &ClusterObjectRef) -> Result<String> {
        let replicas = self.replicas(reference).await?;
        if replicas == 1 {
            return Ok(reference.ordinal_pod_name(0));
        }

        let selector = self.selector(reference, PodRole::Primary);
        let names = self.pod_names(reference, &selector).await?;

        match names.len() {
            1 => Ok(names.into_iter().next().unwrap_or_default()),
            0 => Err(TopologyError::NoMatch {
                namespace: reference.namespace().to_string(),
                selector: selector.to_string(),
            }
            .into()),
            count => Err(TopologyError::Ambiguous {
                selector: selector.to_string(),
                count,
                pods: names,
            }
            .into()),
        }
    }

    /// Name of any pod labeled standby, `None` for a standalone resource
    pub async fn standby_pod_name(&self, reference: &ClusterObjectRef) -> Result<Option<String>> {
        let replicas = self.replicas(reference).await?;
        if replicas == 1 {
            return Ok(None);
        }

        let selector = self.selector(reference, PodRole::Standby);
        let names = self.pod_names(reference, &selector).await?;

        match names.into_iter().next() {
            Some(name) => Ok(Some(name)),
            None => Err(TopologyError::NoMatch {
                namespace: reference.namespace().to_string(),
                selector: selector.to_string(),
            }
            .into()),
        }
    }

    /// Names of every pod labeled standby (empty for a standalone resource)
    pub async fn standby_pod_names(&self, reference: &ClusterObjectRef) -> Result<Vec<String>> {
        if self.replicas(reference).await? == 1 {
            return Ok(Vec::new());
        }
        let selector = self.selector(reference, PodRole::Standby);
        self.pod_names(reference, &selector).await
    }

    /// Current role of a named pod
    pub async fn role_of(&self, reference: &ClusterObjectRef, pod: &str) -> Result<PodRole> {
        let pod = self.cluster.get_pod(reference.namespace(), pod).await?;
        Ok(pod
            .map(|p| PodRole::of_pod(&p, &self.config.labels))
            .unwrap_or(PodRole::Unknown))
    }

    /// Selector for `role` pods of `reference`
    pub fn selector(&self, reference: &ClusterObjectRef, role: PodRole) -> RoleSelector {
        let labels = &self.config.labels;
        RoleSelector::for_resource(reference.name(), labels).with_role(role, labels)
    }

    async fn replicas(&self, reference: &ClusterObjectRef) -> Result<i32> {
        let postgres = self.cluster.get_database(reference).await?;
        match postgres.replicas() {
            Some(n) if n >= 1 => Ok(n),
            Some(n) => Err(Error::InvalidConfig(format!(
                "{} has invalid spec.replicas {}",
                reference, n
            ))),
            None => Err(Error::InvalidConfig(format!(
                "{} has no spec.replicas",
                reference
            ))),
        }
    }

    async fn pod_names(
        &self,
        reference: &ClusterObjectRef,
        selector: &RoleSelector,
    ) -> Result<Vec<String>> {
        let selector_str = selector.to_string();
        debug!(resource = %reference, selector = %selector_str, "Resolving pods by role");

        let pods = self
            .cluster
            .list_pods(reference.namespace(), &selector_str)
            .await?;

        pods.into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .map(|p: Pod| {
                p.metadata
                    .name
                    .ok_or_else(|| Error::from(TopologyError::UnnamedPod(selector_str.clone())))
            })
            .collect()
    }
}
