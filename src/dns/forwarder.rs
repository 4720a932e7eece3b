//! Upstream forwarding with ordered failover.
//!
//! Queries are relayed verbatim. Each upstream gets one attempt on a fresh
//! socket bounded by a timeout; the first reply wins. When every upstream
//! fails the query is dropped and the client receives nothing.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

/// Maximum DNS message size accepted over UDP.
pub const MAX_UDP_DNS_SIZE: usize = 4096;

/// Per-upstream wait for a reply.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Trait for relaying raw queries upstream.
///
/// Returns `None` when no upstream answered.
pub trait DnsForwarder: Send + Sync + Clone + 'static {
    fn forward(&self, query: &[u8]) -> impl Future<Output = Option<Vec<u8>>> + Send;
}

/// Failure of a single upstream attempt.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Forwards to a fixed, ordered list of upstream servers.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    servers: Arc<[SocketAddr]>,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            servers: servers.into(),
            timeout,
        }
    }

    /// One attempt against one upstream.
    pub async fn exchange(&self, server: SocketAddr, query: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_UDP_DNS_SIZE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ForwardError::Timeout(self.timeout))??;
        buf.truncate(len);
        Ok(buf)
    }
}

impl DnsForwarder for UpstreamForwarder {
    async fn forward(&self, query: &[u8]) -> Option<Vec<u8>> {
        for server in self.servers.iter().copied() {
            match self.exchange(server, query).await {
                Ok(response) => return Some(response),
                Err(err) => {
                    tracing::debug!(%server, error = %err, "upstream attempt failed");
                }
            }
        }
        None
    }
}
