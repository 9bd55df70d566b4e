// ABOUTME: Error types for nest-transport
// ABOUTME: TransportError is fatal to the transport; SendError is per-attempt and retryable

use crate::AgentId;
use std::time::Duration;
use thiserror::Error;

/// Errors that end a transport's life: the medium cannot be acquired or broke.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to acquire medium: {0}")]
    Open(String),

    #[error("Transport open timed out after {0:?}")]
    OpenTimeout(Duration),

    #[error("Transport io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-attempt send failure. The delivery engine retries these.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("No known address for agent {0}")]
    UnknownPeer(AgentId),

    #[error("Medium write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Agent id too long for radio frame header: {0}")]
    IdTooLong(AgentId),

    #[error("Transport closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display_open() {
        let err = TransportError::Open("port in use".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Failed to acquire medium"));
        assert!(display.contains("port in use"));
    }

    #[test]
    fn test_transport_error_display_timeout() {
        let err = TransportError::OpenTimeout(Duration::from_secs(5));
        assert!(format!("{}", err).contains("timed out"));
    }

    #[test]
    fn test_send_error_display_unknown_peer() {
        let err = SendError::UnknownPeer(AgentId::new("agent-1"));
        let display = format!("{}", err);
        assert!(display.contains("No known address"));
        assert!(display.contains("agent-1"));
    }

    #[test]
    fn test_send_error_display_frame_too_large() {
        let err = SendError::FrameTooLarge { size: 2048, max: 1024 };
        let display = format!("{}", err);
        assert!(display.contains("2048"));
        assert!(display.contains("1024"));
    }
}
