//! In-memory cluster and resource builders

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Pod, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use postgres_e2e::config::LabelConfig;
use postgres_e2e::crd::PostgresStatus;
use postgres_e2e::{
    ClusterApi, ClusterObjectRef, DatabasePhase, DirectUpstream, Error, PollSpec, Postgres,
    PostgresSpec, Result, Upstream, VerifierConfig,
};

/// Address nothing listens on; connecting to it is refused
pub const UNREACHABLE: &str = "127.0.0.1:1";

#[derive(Default)]
struct State {
    databases: BTreeMap<(String, String), Postgres>,
    pods: BTreeMap<(String, String), Pod>,
    secrets: BTreeMap<(String, String), Secret>,
    upstreams: BTreeMap<String, SocketAddr>,
    list_calls: usize,
    deleted_pods: Vec<String>,
}

/// [`ClusterApi`] over in-memory objects
///
/// Pod ports are reached through [`DirectUpstream`] to whatever address was
/// registered with [`FakeCluster::route`].
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_database(&self, postgres: Postgres) {
        let key = (
            postgres.metadata.namespace.clone().unwrap_or_default(),
            postgres.metadata.name.clone().unwrap_or_default(),
        );
        self.state.lock().unwrap().databases.insert(key, postgres);
    }

    pub fn set_phase(&self, reference: &ClusterObjectRef, phase: DatabasePhase) {
        let mut state = self.state.lock().unwrap();
        let key = (reference.namespace().to_string(), reference.name().to_string());
        if let Some(pg) = state.databases.get_mut(&key) {
            pg.status = Some(PostgresStatus {
                phase,
                ..Default::default()
            });
        }
    }

    pub fn put_pod(&self, namespace: &str, pod: Pod) {
        let key = (namespace.to_string(), pod.metadata.name.clone().unwrap_or_default());
        self.state.lock().unwrap().pods.insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().unwrap().pods.remove(&key);
    }

    pub fn put_secret(&self, namespace: &str, secret: Secret) {
        let key = (namespace.to_string(), secret.metadata.name.clone().unwrap_or_default());
        self.state.lock().unwrap().secrets.insert(key, secret);
    }

    /// Send tunnel traffic for `pod` to `addr`
    pub fn route(&self, pod: &str, addr: SocketAddr) {
        self.state
            .lock()
            .unwrap()
            .upstreams
            .insert(pod.to_string(), addr);
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_pods.clone()
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} {:?} not found", kind, name),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_database(&self, reference: &ClusterObjectRef) -> Result<Postgres> {
        let key = (reference.namespace().to_string(), reference.name().to_string());
        self.state
            .lock()
            .unwrap()
            .databases
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("postgres", reference.name()))
    }

    async fn create_database(&self, postgres: &Postgres) -> Result<Postgres> {
        self.put_database(postgres.clone());
        Ok(postgres.clone())
    }

    async fn delete_database(&self, reference: &ClusterObjectRef) -> Result<()> {
        let key = (reference.namespace().to_string(), reference.name().to_string());
        self.state.lock().unwrap().databases.remove(&key);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let wanted = parse_selector(selector);
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod)
            .filter(|pod| {
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self.state.lock().unwrap().pods.get(&key).cloned())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        match state.pods.remove(&key) {
            Some(_) => {
                state.deleted_pods.push(name.to_string());
                Ok(())
            }
            None => Err(not_found("pod", name)),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self.state.lock().unwrap().secrets.get(&key).cloned())
    }

    fn upstream(&self, _namespace: &str, pod: &str, _port: u16) -> Arc<dyn Upstream> {
        let addr = self
            .state
            .lock()
            .unwrap()
            .upstreams
            .get(pod)
            .copied()
            .unwrap_or_else(|| UNREACHABLE.parse().unwrap());
        Arc::new(DirectUpstream::new(addr))
    }
}

/// Database resource with `replicas` members
pub fn postgres(reference: &ClusterObjectRef, replicas: Option<i32>) -> Postgres {
    Postgres {
        metadata: ObjectMeta {
            name: Some(reference.name().to_string()),
            namespace: Some(reference.namespace().to_string()),
            ..Default::default()
        },
        spec: PostgresSpec {
            version: "9.6-v1".to_string(),
            replicas,
            storage_type: None,
            storage: None,
        },
        status: None,
    }
}

/// Ownership (and optionally role) labels the operator puts on a member pod
pub fn member_labels(resource: &str, role: Option<&str>) -> BTreeMap<String, String> {
    let labels = LabelConfig::default();
    let mut map = BTreeMap::from([
        (labels.name_key.clone(), resource.to_string()),
        (labels.kind_key.clone(), labels.kind_value.clone()),
    ]);
    if let Some(role) = role {
        map.insert(labels.role_key.clone(), role.to_string());
    }
    map
}

/// Pod named `name` with `labels` in `phase`
pub fn pod(name: &str, labels: BTreeMap<String, String>, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Running member pod of `resource` with `role` (`primary` or `replica`)
pub fn member(resource: &str, ordinal: u32, role: Option<&str>) -> Pod {
    pod(
        &format!("{}-{}", resource, ordinal),
        member_labels(resource, role),
        "Running",
    )
}

/// Mark a pod as being deleted
pub fn terminating(mut pod: Pod) -> Pod {
    pod.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    pod
}

/// Auth secret `<name>-auth` holding `password`
pub fn auth_secret(resource: &str, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(format!("{}-auth", resource)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "POSTGRES_PASSWORD".to_string(),
            ByteString(password.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Auth secret `<name>-auth` naming `user` as well as its `password`
pub fn auth_secret_for(resource: &str, user: &str, password: &str) -> Secret {
    let mut secret = auth_secret(resource, password);
    if let Some(data) = secret.data.as_mut() {
        data.insert("POSTGRES_USER".to_string(), ByteString(user.as_bytes().to_vec()));
    }
    secret
}

/// Config whose every poll uses `interval` and `timeout`
pub fn fast_config(interval: Duration, timeout: Duration) -> Arc<VerifierConfig> {
    Arc::new(config_with(PollSpec::new(interval, timeout)))
}

/// Default config with every poll replaced by `spec`
pub fn config_with(spec: PollSpec) -> VerifierConfig {
    let mut config = VerifierConfig::default();
    let p = &mut config.polling;
    for slot in [
        &mut p.replication,
        &mut p.schema,
        &mut p.tables,
        &mut p.count,
        &mut p.ping,
        &mut p.insert,
        &mut p.health,
        &mut p.running,
        &mut p.pod_ready,
    ] {
        *slot = spec;
    }
    config
}

/// Loopback server echoing every byte back; stands in for a pod port
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Loopback server that accepts and immediately hangs up
pub async fn hangup_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    addr
}
