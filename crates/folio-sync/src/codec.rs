//! # Envelope Codec
//!
//! Newline-delimited JSON framing for [`Envelope`]s.
//!
//! ## Framing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  bytes in ──► BytesMut ──► scan for '\n' ──► JSON ──► Envelope          │
//! │                               │                                         │
//! │                               └─ no '\n' and buffer > cap               │
//! │                                  → FrameTooLarge (connection ends)      │
//! │                                                                         │
//! │  Envelope ──► compact JSON ──► + '\n' ──► bytes out                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The decoder remembers how far it has already scanned so a slow sender
//! dribbling bytes is not rescanned from the start each time. Blank lines
//! are skipped; a trailing `\r` is tolerated.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{SyncError, SyncResult};
use crate::protocol::Envelope;

/// Default per-connection buffer cap (64 KiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

// =============================================================================
// Pure Encode / Decode
// =============================================================================

/// Serializes an envelope into one wire line, delimiter included.
pub fn encode_line(envelope: &Envelope) -> SyncResult<Vec<u8>> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    Ok(line)
}

/// Parses one frame (without its delimiter) into an envelope.
///
/// Unknown `type` tags and malformed JSON are both protocol errors.
pub fn decode_frame(frame: &[u8]) -> SyncResult<Envelope> {
    serde_json::from_slice(frame).map_err(|e| SyncError::InvalidMessage(e.to_string()))
}

// =============================================================================
// Streaming Codec
// =============================================================================

/// `tokio_util` codec used by every [`crate::connection::Connection`].
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_bytes: usize,
    next_index: usize,
}

impl EnvelopeCodec {
    /// Creates a codec with the given buffer cap.
    pub fn new(max_frame_bytes: usize) -> Self {
        EnvelopeCodec {
            max_frame_bytes,
            next_index: 0,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        EnvelopeCodec::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = SyncError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, SyncError> {
        loop {
            let scan_from = self.next_index.min(buf.len());
            let newline = buf[scan_from..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if buf.len() > self.max_frame_bytes {
                    return Err(SyncError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let end = scan_from + offset;
            self.next_index = 0;

            let line = buf.split_to(end + 1);
            let mut frame = &line[..end];
            if let Some(stripped) = frame.strip_suffix(b"\r") {
                frame = stripped;
            }

            if frame.len() > self.max_frame_bytes {
                return Err(SyncError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
            }

            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return decode_frame(frame).map(Some);
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, SyncError> {
        if let Some(envelope) = self.decode(buf)? {
            return Ok(Some(envelope));
        }

        // Whatever is left never got its delimiter.
        let truncated = !buf.iter().all(u8::is_ascii_whitespace);
        buf.clear();
        self.next_index = 0;

        if truncated {
            return Err(SyncError::InvalidMessage(
                "stream ended inside a frame".to_string(),
            ));
        }
        Ok(None)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = SyncError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), SyncError> {
        let line = encode_line(&envelope)?;
        dst.reserve(line.len());
        dst.put_slice(&line);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;

    #[test]
    fn test_encode_appends_single_newline() {
        let line = encode_line(&Envelope::Heartbeat).unwrap();
        assert_eq!(line, b"{\"type\":\"heartbeat\"}\n".to_vec());
    }

    #[test]
    fn test_decode_waits_for_delimiter() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::from(&b"{\"type\":\"heart"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"beat\"}\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Envelope::Heartbeat));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_frames_in_one_read() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"type\":\"heartbeat\"}\r\n\n");
        buf.extend_from_slice(
            b"{\"type\":\"error\",\"payload\":{\"code\":\"auth_required\",\"message\":\"x\"}}\n",
        );

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Envelope::Heartbeat));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.error_code(), Some(ErrorCode::AuthRequired));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_buffer_is_rejected() {
        let mut codec = EnvelopeCodec::new(16);
        let mut buf = BytesMut::from(&b"{\"type\":\"heartbeat\"   "[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(SyncError::FrameTooLarge { limit: 16 })
        ));
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::from(&b"{\"type\":\"subscribe\",\"payload\":{}}\n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let err = decode_frame(b"not json at all").unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }

    #[test]
    fn test_eof_inside_frame() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::from(&b"{\"type\":"[..]);
        assert!(codec.decode_eof(&mut buf).is_err());

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }
}
