//! Message framing for peer streams
//!
//! Provides length-prefixed framing over TCP. Frames of a type this build does
//! not know are skipped so a newer peer can add control frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Maximum frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("Empty frame")]
    Empty,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Bytes,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Connection handshake
    Hello = 1,
    /// Encoded protocol envelope
    Message = 2,
    /// Keepalive
    Ping = 3,
}

impl FrameType {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Hello),
            2 => Some(Self::Message),
            3 => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Need at least 5 bytes (4 length + 1 type)
            if src.len() < 5 {
                return Ok(None);
            }

            // Peek at length
            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

            if length == 0 {
                return Err(FrameError::Empty);
            }
            if length > MAX_FRAME_SIZE {
                return Err(FrameError::TooLarge(length));
            }

            // Need full frame
            if src.len() < 4 + length {
                src.reserve(4 + length - src.len());
                return Ok(None);
            }

            // Consume length prefix
            src.advance(4);

            // Read frame type
            let raw_type = src[0];
            src.advance(1);

            // Read payload
            let payload = src.split_to(length - 1).freeze();

            match FrameType::from_wire(raw_type) {
                Some(frame_type) => return Ok(Some(Frame { frame_type, payload })),
                None => debug!("Skipping frame of unknown type {}", raw_type),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.checked_len()?;

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Create a frame carrying an encoded envelope
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Message, payload)
    }

    /// Length as written in the prefix (type byte plus payload), or
    /// `TooLarge` if the frame cannot be sent
    pub fn checked_len(&self) -> Result<usize, FrameError> {
        let length = 1 + self.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        Ok(length)
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, Bytes::new())
    }

    /// Create a frame with a postcard-encoded control payload
    pub fn control<T: Serialize>(frame_type: FrameType, value: &T) -> Result<Self, FrameError> {
        Ok(Self::new(frame_type, postcard::to_allocvec(value)?))
    }

    /// Decode a postcard control payload
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::message(vec![1, 2, 3, 4, 5]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Frame::message(vec![9; 32]), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[10..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload.len(), 32);
    }

    #[test]
    fn test_unknown_frame_type_skipped() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(200);
        buf.put_slice(&[1, 2]);
        codec.encode(Frame::ping(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Ping);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u8(FrameType::Message as u8);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(_))));

        let too_big = Frame::message(vec![0; MAX_FRAME_SIZE]);
        assert!(matches!(too_big.checked_len(), Err(FrameError::TooLarge(_))));
        assert!(codec.encode(too_big, &mut BytesMut::new()).is_err());

        let largest = Frame::message(vec![0; MAX_FRAME_SIZE - 1]);
        assert_eq!(largest.checked_len().unwrap(), MAX_FRAME_SIZE);
    }
}
