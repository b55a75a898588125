//! Kubernetes collaborator interface
//!
//! Everything the verification engine needs from the cluster goes through
//! [`ClusterApi`]. Production code uses [`KubeCluster`]; tests mock or fake it.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::crd::{ClusterObjectRef, Postgres};
use crate::error::Result;
use crate::tunnel::{PortForwardUpstream, Upstream};

#[cfg(test)]
use mockall::automock;

/// Narrow view of the Kubernetes API used by the resolver, tunnels and oracle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch the database resource under test
    async fn get_database(&self, reference: &ClusterObjectRef) -> Result<Postgres>;

    /// Create a database resource
    async fn create_database(&self, postgres: &Postgres) -> Result<Postgres>;

    /// Delete the database resource; deleting a missing resource succeeds
    async fn delete_database(&self, reference: &ClusterObjectRef) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Fetch a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Delete a pod in the foreground
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Fetch a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Channel that reaches `pod:port` from outside the cluster network
    fn upstream(&self, namespace: &str, pod: &str, port: u16) -> Arc<dyn Upstream>;
}

/// [`ClusterApi`] backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig (~/.kube/config or KUBECONFIG)
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_database(&self, reference: &ClusterObjectRef) -> Result<Postgres> {
        let api: Api<Postgres> = Api::namespaced(self.client.clone(), reference.namespace());
        Ok(api.get(reference.name()).await?)
    }

    async fn create_database(&self, postgres: &Postgres) -> Result<Postgres> {
        let namespace = postgres.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Postgres> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), postgres).await?)
    }

    async fn delete_database(&self, reference: &ClusterObjectRef) -> Result<()> {
        let api: Api<Postgres> = Api::namespaced(self.client.clone(), reference.namespace());
        match api.delete(reference.name(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace, selector, "Listing pods");
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get_opt(name).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?)
    }

    fn upstream(&self, namespace: &str, pod: &str, port: u16) -> Arc<dyn Upstream> {
        Arc::new(PortForwardUpstream::new(
            Api::namespaced(self.client.clone(), namespace),
            pod,
            port,
        ))
    }
}
