use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default body chunk size agreed by every agent (64KB - 1)
pub const DEFAULT_CHUNK_SIZE: usize = 65535;

/// Length prefix size: u32 big-endian
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Frame header size: length(4) + command(1)
pub const FRAME_HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// A single protocol packet.
///
/// The codec only does length accounting; the payload is interpreted by
/// [`super::command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet
    pub fn new(command: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Create a packet without payload
    pub fn empty(command: u8) -> Self {
        Self::new(command, Bytes::new())
    }

    /// Serialize packet to bytes
    /// Wire format: length(4) + command(1) + payload(N), length covers command + payload
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32((self.payload.len() + 1) as u32);
        buf.put_u8(self.command);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Framing error
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Zero-length frame")]
    Empty,
    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Unknown command: {0:#04x}")]
    UnknownCommand(u8),
    #[error("Malformed {command} payload: {reason}")]
    Malformed {
        command: &'static str,
        reason: &'static str,
    },
}

/// Tokio codec for encoding/decoding milter packets
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    /// Create a codec rejecting payloads above `max_payload`
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Raise or lower the bound, e.g. once a larger chunk size was negotiated
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_HEADER_SIZE + item.payload.len());
        dst.put_u32((item.payload.len() + 1) as u32);
        dst.put_u8(item.command);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length without consuming it
        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if declared == 0 {
            return Err(FrameError::Empty);
        }

        let payload_len = declared - 1;
        if payload_len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                limit: self.max_payload,
            });
        }

        let total_len = LENGTH_PREFIX_SIZE + declared;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut buf = src.split_to(total_len);
        buf.advance(LENGTH_PREFIX_SIZE);
        let command = buf.get_u8();
        let payload = buf.freeze();

        Ok(Some(Packet { command, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_serialize_decode() {
        let packet = Packet::new(b'L', &b"Subject\0hello\0"[..]);
        let serialized = packet.serialize();
        assert_eq!(&serialized[..4], &15u32.to_be_bytes());

        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&serialized[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x00, 0x06, b'B', b'h']);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ello");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.command, b'B');
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn test_codec_back_to_back_frames() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Packet::empty(b'N'), &mut buf).unwrap();
        codec.encode(Packet::new(b'B', &b"x"[..]), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, b'N');
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, b'B');
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_zero_length() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::Empty)));
    }

    #[test]
    fn test_codec_rejects_oversized_before_buffering() {
        let mut codec = PacketCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(18);
        buf.put_u8(b'B');
        match codec.decode(&mut buf) {
            Err(FrameError::PayloadTooLarge { size, limit }) => {
                assert_eq!(size, 17);
                assert_eq!(limit, 16);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_codec_accepts_payload_at_limit() {
        let mut codec = PacketCodec::default();
        let body = vec![b'x'; DEFAULT_CHUNK_SIZE];
        let mut buf = BytesMut::new();
        codec
            .encode(Packet::new(b'B', body.clone()), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), DEFAULT_CHUNK_SIZE);
    }
}
