//! Tunnels from the test driver to a pod port
//!
//! A [`Tunnel`] binds an ephemeral loopback port and bridges every
//! connection accepted there to one pod port. It is owned by whoever
//! opened it; `close` is idempotent and `Drop` stops the forwarding if
//! `close` was never awaited.

mod upstream;

pub use upstream::{DirectUpstream, PortForwardUpstream, Upstream};

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::cluster::ClusterApi;
use crate::crd::ClusterObjectRef;
use crate::error::{Result, TunnelError};

/// Upper bound on waiting for the forwarding loop to stop
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ephemeral forwarding from `127.0.0.1:<local_port>` to `remote_pod:remote_port`
#[derive(Debug)]
pub struct Tunnel {
    local_port: u16,
    remote_pod: String,
    remote_port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl Tunnel {
    /// Handshake with `upstream`, bind a free loopback port and start forwarding
    pub async fn start(
        upstream: Arc<dyn Upstream>,
        remote_pod: &str,
        remote_port: u16,
    ) -> Result<Self> {
        upstream.handshake().await?;

        // The listener keeps the port reserved until the forwarding loop exits
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(TunnelError::Bind)?;
        let local_port = listener.local_addr().map_err(TunnelError::Bind)?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_forwarding(listener, upstream, shutdown_rx));

        tracing::info!(
            local_port = local_port,
            pod = %remote_pod,
            remote_port = remote_port,
            "Tunnel established"
        );

        Ok(Self {
            local_port,
            remote_pod: remote_pod.to_string(),
            remote_port,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            closed: false,
        })
    }

    /// Local port forwarding to the remote target
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_pod(&self) -> &str {
        &self.remote_pod
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop forwarding and wait for the local port to be released.
    ///
    /// Closing an already closed tunnel is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        tracing::debug!(local_port = self.local_port, "Closing tunnel");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(TEARDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TunnelError::Teardown(e.to_string()).into()),
                Err(_) => {
                    handle.abort();
                    return Err(TunnelError::Teardown(format!(
                        "forwarding loop did not stop within {:?}",
                        TEARDOWN_TIMEOUT
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(local_port = self.local_port, "Tunnel dropped without close");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Accept local connections until shutdown, bridging each one upstream
async fn run_forwarding(
    listener: TcpListener,
    upstream: Arc<dyn Upstream>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::debug!("Tunnel shutdown requested");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::trace!(client_addr = %addr, "New tunnel connection");
                        let upstream = upstream.clone();
                        connections.spawn(async move {
                            if let Err(e) = upstream.bridge(stream).await {
                                tracing::warn!(error = %e, "Tunnel connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Tunnel accept error");
                    }
                }
            }
            // Reap finished connections so the set does not grow unbounded
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    drop(listener);
}

/// Opens tunnels to pods of the resource under test
#[derive(Clone)]
pub struct TunnelManager {
    cluster: Arc<dyn ClusterApi>,
}

impl TunnelManager {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Open a tunnel to `pod:remote_port` in the resource's namespace.
    ///
    /// Fails with a tunnel error if the pod does not exist, is not running,
    /// or the forwarding handshake fails.
    pub async fn open(
        &self,
        reference: &ClusterObjectRef,
        pod: &str,
        remote_port: u16,
    ) -> Result<Tunnel> {
        let namespace = reference.namespace();

        let found = self.cluster.get_pod(namespace, pod).await?;
        let found = found.ok_or_else(|| TunnelError::PodNotFound {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        })?;

        let phase = found
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        if phase != "Running" {
            return Err(TunnelError::Handshake {
                pod: pod.to_string(),
                port: remote_port,
                reason: format!("pod phase is {}", phase),
            }
            .into());
        }

        tracing::debug!(
            namespace = namespace,
            pod = %pod,
            remote_port = remote_port,
            "Opening tunnel"
        );

        let upstream = self.cluster.upstream(namespace, pod, remote_port);
        Tunnel::start(upstream, pod, remote_port).await
    }

    /// Close a tunnel; closing twice is a no-op
    pub async fn close(&self, tunnel: &mut Tunnel) -> Result<()> {
        tunnel.close().await
    }
}
