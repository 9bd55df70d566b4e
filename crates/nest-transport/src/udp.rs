// ABOUTME: UDP transport: one bound socket, agent identity from the peer address.
// ABOUTME: Sends target the last-known address observed for each agent.

use crate::{AgentId, SendError, Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Maximum UDP datagram we accept.
const MAX_DATAGRAM: usize = 65536;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local bind address, e.g. "0.0.0.0"
    pub bind_address: String,
    /// Local bind port (0 = ephemeral)
    pub port: u16,
    /// Timeout for acquiring the socket
    pub open_timeout: Duration,
}

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peers: Mutex<HashMap<AgentId, SocketAddr>>,
    closed: CancellationToken,
}

impl UdpTransport {
    /// Bind the local socket. Fails if the port is in use or binding times out.
    pub async fn open(config: &UdpConfig) -> Result<Self, TransportError> {
        let bind = format!("{}:{}", config.bind_address, config.port);
        let socket = tokio::time::timeout(config.open_timeout, UdpSocket::bind(&bind))
            .await
            .map_err(|_| TransportError::OpenTimeout(config.open_timeout))?
            .map_err(|e| TransportError::Open(format!("bind {}: {}", bind, e)))?;

        tracing::info!(local = %socket.local_addr()?, "UDP transport open");
        Ok(Self {
            socket,
            peers: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    /// The bound local address (useful when binding to an ephemeral port).
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    fn peer_addr(&self, agent: &AgentId) -> Option<SocketAddr> {
        if let Some(addr) = self.peers.lock().expect("peer map poisoned").get(agent) {
            return Some(*addr);
        }
        // Address-shaped ids are routable even before the peer is observed
        agent.as_str().parse().ok()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn send(&self, agent: &AgentId, payload: &[u8]) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        let addr = self
            .peer_addr(agent)
            .ok_or_else(|| SendError::UnknownPeer(agent.clone()))?;
        self.socket.send_to(payload, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<(AgentId, Vec<u8>)>, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            result = self.socket.recv_from(&mut buf) => {
                let (len, addr) = result?;
                buf.truncate(len);
                let agent = AgentId::from(addr);
                self.peers
                    .lock()
                    .expect("peer map poisoned")
                    .insert(agent.clone(), addr);
                Ok(Some((agent, buf)))
            }
        }
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!("UDP transport closed");
        }
        self.closed.cancel();
    }
}
