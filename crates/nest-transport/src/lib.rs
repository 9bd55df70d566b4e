// ABOUTME: Transport trait defining how nest moves bytes to and from remote agents.
// ABOUTME: Implementations: UdpTransport (network sockets), RadioTransport (serial links).

mod error;
mod frame;
mod radio;
mod udp;

pub use error::{SendError, TransportError};
pub use frame::{decode_frame, encode_frame, FRAME_HEADER_LEN};
pub use radio::{RadioConfig, RadioTransport};
pub use udp::{UdpConfig, UdpTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Opaque agent identity: a UDP peer address, a radio node id, or a logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<SocketAddr> for AgentId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Which medium carries an agent's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Radio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Radio => write!(f, "radio"),
        }
    }
}

/// A transport is a bidirectional link to many agents behind one medium.
///
/// Everything above this trait is transport-agnostic: the delivery engine and
/// runner never branch on the concrete variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The medium this transport drives
    fn kind(&self) -> TransportKind;

    /// Send one payload to the named agent. Recoverable per-attempt failure.
    async fn send(&self, agent: &AgentId, payload: &[u8]) -> Result<(), SendError>;

    /// Wait for the next inbound datagram/frame.
    ///
    /// Returns `Ok(None)` once the transport has been closed; pending callers
    /// are unblocked by `close()`.
    async fn recv(&self) -> Result<Option<(AgentId, Vec<u8>)>, TransportError>;

    /// Release the underlying medium. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let id = AgentId::from(addr);
        assert_eq!(id.as_str(), "127.0.0.1:9000");
    }

    #[test]
    fn test_agent_id_display_and_eq() {
        let a = AgentId::new("agent-1");
        let b = AgentId::from("agent-1");
        assert_eq!(a, b);
        assert_eq!(format!("{}", a), "agent-1");
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Udp.to_string(), "udp");
        assert_eq!(TransportKind::Radio.to_string(), "radio");
    }
}
