// ABOUTME: Radio transport: one serial/hardware handle carrying framed traffic.
// ABOUTME: Frames carry an explicit node-id header; partial reads are reassembled.

use crate::frame::{decode_frame, encode_frame};
use crate::{AgentId, SendError, Transport, TransportError, TransportKind};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RadioConfig {
    /// Serial device path, e.g. "/dev/ttyUSB0"
    pub device_path: String,
    /// Baud rate the device is provisioned at (logged; the line is assumed configured)
    pub baud_rate: u32,
    /// Maximum frame size (header + node id + payload)
    pub max_frame_bytes: usize,
    /// Timeout for acquiring the device
    pub open_timeout: Duration,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct RadioReader {
    inner: BoxedReader,
    /// Bytes accumulated across partial reads until a frame completes
    buf: BytesMut,
}

pub struct RadioTransport {
    reader: Mutex<RadioReader>,
    writer: Mutex<BoxedWriter>,
    closed: CancellationToken,
    max_frame_bytes: usize,
}

impl std::fmt::Debug for RadioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioTransport")
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl RadioTransport {
    /// Acquire the radio device. Fails if the device is missing or opening times out.
    pub async fn open(config: &RadioConfig) -> Result<Self, TransportError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.read(true).write(true);
        let open = options.open(&config.device_path);
        let file = tokio::time::timeout(config.open_timeout, open)
            .await
            .map_err(|_| TransportError::OpenTimeout(config.open_timeout))?
            .map_err(|e| TransportError::Open(format!("{}: {}", config.device_path, e)))?;

        tracing::info!(
            device = %config.device_path,
            baud = config.baud_rate,
            "Radio transport open"
        );
        Ok(Self::from_stream(file, config.max_frame_bytes))
    }

    /// Build a radio transport over any byte stream. Tests use `tokio::io::duplex`.
    pub fn from_stream<S>(stream: S, max_frame_bytes: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(RadioReader {
                inner: Box::new(read_half),
                buf: BytesMut::with_capacity(max_frame_bytes * 2),
            }),
            writer: Mutex::new(Box::new(write_half)),
            closed: CancellationToken::new(),
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl Transport for RadioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    async fn send(&self, agent: &AgentId, payload: &[u8]) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        let frame = encode_frame(agent, payload, self.max_frame_bytes)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<(AgentId, Vec<u8>)>, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = &mut *guard;
        loop {
            if let Some(frame) = decode_frame(&mut reader.buf, self.max_frame_bytes) {
                return Ok(Some(frame));
            }
            let read = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                r = reader.inner.read_buf(&mut reader.buf) => r?,
            };
            if read == 0 {
                // Stream ended; whatever is buffered can never complete a frame
                return Ok(None);
            }
        }
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!("Radio transport closed");
        }
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MAX_FRAME: usize = 256;

    #[tokio::test]
    async fn test_recv_reassembles_partial_writes() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let transport = RadioTransport::from_stream(ours, MAX_FRAME);

        let frame = encode_frame(&AgentId::new("node-7"), b"split me", MAX_FRAME).unwrap();
        let remote = tokio::spawn(async move {
            for chunk in frame.chunks(3) {
                theirs.write_all(chunk).await.unwrap();
                theirs.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            theirs
        });

        let (agent, payload) = transport.recv().await.unwrap().unwrap();
        assert_eq!(agent.as_str(), "node-7");
        assert_eq!(payload, b"split me");
        drop(remote.await.unwrap());
    }

    #[tokio::test]
    async fn test_send_produces_decodable_frame() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let transport = RadioTransport::from_stream(ours, MAX_FRAME);
        let (mut remote_read, _remote_write) = tokio::io::split(theirs);

        transport
            .send(&AgentId::new("node-3"), b"ping")
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let decoded = loop {
            if let Some(frame) = decode_frame(&mut buf, MAX_FRAME) {
                break frame;
            }
            remote_read.read_buf(&mut buf).await.unwrap();
        };
        assert_eq!(decoded.0.as_str(), "node-3");
        assert_eq!(decoded.1, b"ping");
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_eof() {
        let (ours, theirs) = tokio::io::duplex(64);
        let transport = RadioTransport::from_stream(ours, MAX_FRAME);
        drop(theirs);

        assert!(transport.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_unblocks_recv() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let transport = Arc::new(RadioTransport::from_stream(ours, MAX_FRAME));

        let recv_side = transport.clone();
        let handle = tokio::spawn(async move { recv_side.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("recv should unblock")
            .unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_send_rejects_oversize_payload() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let transport = RadioTransport::from_stream(ours, MAX_FRAME);

        let payload = vec![0u8; MAX_FRAME + 1];
        let err = transport
            .send(&AgentId::new("node-1"), &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_open_fails_on_missing_device() {
        let config = RadioConfig {
            device_path: "/dev/does-not-exist-nest".to_string(),
            baud_rate: 57600,
            max_frame_bytes: MAX_FRAME,
            open_timeout: Duration::from_secs(1),
        };
        let err = RadioTransport::open(&config).await.unwrap_err();
        assert!(matches!(err, TransportError::Open(_)));
    }
}
