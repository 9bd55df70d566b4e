// ABOUTME: Radio frame encoding and incremental decoding.
// ABOUTME: Length-prefixed frames with an explicit node-id header; tolerates partial reads.

use crate::{AgentId, SendError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame layout on the wire:
///
/// ```text
/// [magic: 0xA5] [id_len: u8] [payload_len: u16 BE] [node id bytes] [payload bytes]
/// ```
///
/// Hardware links deliver arbitrary byte chunks; the decoder accumulates until
/// a whole frame is present and resynchronizes on a bad magic byte.
const FRAME_MAGIC: u8 = 0xA5;

/// Fixed header size preceding the node id and payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Encode one frame. `max_frame` bounds the total encoded size.
pub fn encode_frame(node_id: &AgentId, payload: &[u8], max_frame: usize) -> Result<Bytes, SendError> {
    let id = node_id.as_str().as_bytes();
    if id.len() > u8::MAX as usize {
        return Err(SendError::IdTooLong(node_id.clone()));
    }
    if payload.len() > u16::MAX as usize {
        return Err(SendError::FrameTooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        });
    }

    let total = FRAME_HEADER_LEN + id.len() + payload.len();
    if total > max_frame {
        return Err(SendError::FrameTooLarge {
            size: total,
            max: max_frame,
        });
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(FRAME_MAGIC);
    buf.put_u8(id.len() as u8);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Try to decode one complete frame from the accumulation buffer.
///
/// Returns `None` when more bytes are needed. Consumed bytes are removed from
/// `buf`; garbage before a valid magic byte is skipped one byte at a time.
pub fn decode_frame(buf: &mut BytesMut, max_frame: usize) -> Option<(AgentId, Vec<u8>)> {
    loop {
        // Resync: drop bytes until a magic byte leads the buffer
        while !buf.is_empty() && buf[0] != FRAME_MAGIC {
            buf.advance(1);
        }
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }

        let id_len = buf[1] as usize;
        let payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let total = FRAME_HEADER_LEN + id_len + payload_len;

        if total > max_frame || id_len == 0 {
            // Corrupt header; skip the magic byte and resync
            buf.advance(1);
            continue;
        }
        if buf.len() < total {
            return None;
        }

        buf.advance(FRAME_HEADER_LEN);
        let id_bytes = buf.split_to(id_len);
        let payload = buf.split_to(payload_len).to_vec();

        match std::str::from_utf8(&id_bytes) {
            Ok(id) => return Some((AgentId::new(id), payload)),
            Err(_) => {
                // Node id was not valid utf8; treat the frame as corrupt
                tracing::warn!(id_len, payload_len, "Dropping frame with invalid node id");
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode() {
        let id = AgentId::new("node-7");
        let frame = encode_frame(&id, b"telemetry", 1024).unwrap();

        let mut buf = BytesMut::from(&frame[..]);
        let (decoded_id, payload) = decode_frame(&mut buf, 1024).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(payload, b"telemetry");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let id = AgentId::new("node-7");
        let frame = encode_frame(&id, b"chunked payload", 1024).unwrap();

        // Feed the frame three bytes at a time, as a serial link would
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in frame.chunks(3) {
            buf.extend_from_slice(chunk);
            if let Some(f) = decode_frame(&mut buf, 1024) {
                decoded = Some(f);
            }
        }
        let (decoded_id, payload) = decoded.expect("frame should complete");
        assert_eq!(decoded_id, id);
        assert_eq!(payload, b"chunked payload");
    }

    #[test]
    fn test_decode_skips_leading_garbage() {
        let id = AgentId::new("node-9");
        let frame = encode_frame(&id, b"after noise", 1024).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x13, 0x37]);
        buf.extend_from_slice(&frame);

        let (decoded_id, payload) = decode_frame(&mut buf, 1024).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(payload, b"after noise");
    }

    #[test]
    fn test_decode_two_back_to_back_frames() {
        let a = encode_frame(&AgentId::new("a"), b"one", 1024).unwrap();
        let b = encode_frame(&AgentId::new("b"), b"two", 1024).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let (id_a, p_a) = decode_frame(&mut buf, 1024).unwrap();
        let (id_b, p_b) = decode_frame(&mut buf, 1024).unwrap();
        assert_eq!((id_a.as_str(), p_a.as_slice()), ("a", b"one".as_slice()));
        assert_eq!((id_b.as_str(), p_b.as_slice()), ("b", b"two".as_slice()));
        assert!(decode_frame(&mut buf, 1024).is_none());
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let id = AgentId::new("node-7");
        let payload = vec![0u8; 2048];
        assert!(matches!(
            encode_frame(&id, &payload, 1024),
            Err(SendError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_resyncs_past_corrupt_header() {
        // A magic byte followed by an impossible length, then a valid frame
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FRAME_MAGIC, 0xFF, 0xFF, 0xFF]);
        let frame = encode_frame(&AgentId::new("ok"), b"good", 64).unwrap();
        buf.extend_from_slice(&frame);

        let (id, payload) = decode_frame(&mut buf, 64).unwrap();
        assert_eq!(id.as_str(), "ok");
        assert_eq!(payload, b"good");
    }
}
