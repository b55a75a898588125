//! Channels a tunnel can bridge local connections into

use std::net::SocketAddr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TunnelError};

/// Remote end of a tunnel
///
/// `bridge` is called once per accepted local connection and copies bytes
/// both ways until either side closes.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Verify the remote end is reachable before the tunnel is handed out
    async fn handshake(&self) -> Result<()>;

    /// Copy one local connection to and from the remote end
    async fn bridge(&self, local: TcpStream) -> Result<()>;
}

/// Pod-proxy `portforward` subresource through the Kubernetes API server
pub struct PortForwardUpstream {
    pods: Api<Pod>,
    pod: String,
    port: u16,
}

impl PortForwardUpstream {
    pub fn new(pods: Api<Pod>, pod: &str, port: u16) -> Self {
        Self {
            pods,
            pod: pod.to_string(),
            port,
        }
    }

    fn handshake_error(&self, reason: impl ToString) -> TunnelError {
        TunnelError::Handshake {
            pod: self.pod.clone(),
            port: self.port,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Upstream for PortForwardUpstream {
    async fn handshake(&self) -> Result<()> {
        let pf = self
            .pods
            .portforward(&self.pod, &[self.port])
            .await
            .map_err(|e| self.handshake_error(e))?;
        pf.abort();
        Ok(())
    }

    async fn bridge(&self, local: TcpStream) -> Result<()> {
        let mut pf = self
            .pods
            .portforward(&self.pod, &[self.port])
            .await
            .map_err(|e| self.handshake_error(e))?;

        let upstream = pf
            .take_stream(self.port)
            .ok_or_else(|| self.handshake_error("no stream for forwarded port"))?;

        splice(local, upstream).await;

        pf.join()
            .await
            .map_err(|e| TunnelError::Teardown(e.to_string()))?;
        Ok(())
    }
}

/// Plain TCP to an address the driver can reach directly
///
/// Used when the driver runs inside the cluster network, and by tests.
pub struct DirectUpstream {
    addr: SocketAddr,
}

impl DirectUpstream {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Upstream for DirectUpstream {
    async fn handshake(&self) -> Result<()> {
        TcpStream::connect(self.addr)
            .await
            .map_err(|e| TunnelError::Handshake {
                pod: self.addr.to_string(),
                port: self.addr.port(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn bridge(&self, local: TcpStream) -> Result<()> {
        let upstream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| TunnelError::Handshake {
                pod: self.addr.to_string(),
                port: self.addr.port(),
                reason: e.to_string(),
            })?;
        splice(local, upstream).await;
        Ok(())
    }
}

/// Copy bytes both ways until each direction reaches EOF or fails
async fn splice<U>(mut local: TcpStream, upstream: U)
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = local.split();
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_server = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
        }
        upstream_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let server_to_client = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            local_write.write_all(&buf[..n]).await?;
        }
        local_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    if let Err(e) = tokio::try_join!(client_to_server, server_to_client) {
        tracing::trace!(error = %e, "Forwarded connection ended with error");
    }
}
