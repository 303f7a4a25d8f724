//! Frame encoding/decoding for the stream multiplexer
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! | Version|  Cmd   |   Length (2B)   |
//! +--------+--------+--------+--------+
//! |          Stream ID (4B)           |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol version carried in every frame
pub const VERSION: u8 = 1;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream open
    Syn = 0x00,
    /// Stream close (half-close of the sender's direction)
    Fin = 0x01,
    /// Data
    Psh = 0x02,
    /// Keepalive
    Nop = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Syn),
            0x01 => Ok(FrameType::Fin),
            0x02 => Ok(FrameType::Psh),
            0x03 => Ok(FrameType::Nop),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    fn control(frame_type: FrameType, stream_id: u32) -> Self {
        Self {
            frame_type,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Psh,
            stream_id,
            payload,
        }
    }

    /// Create a stream open frame
    pub fn syn(stream_id: u32) -> Self {
        Self::control(FrameType::Syn, stream_id)
    }

    /// Create a stream close frame
    pub fn fin(stream_id: u32) -> Self {
        Self::control(FrameType::Fin, stream_id)
    }

    /// Create a keepalive frame
    pub fn nop() -> Self {
        Self::control(FrameType::Nop, 0)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(VERSION);
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(payload_len as u16);
        buf.put_u32(self.stream_id);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`. Returns `None` until a
    /// whole frame is buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        if buf[0] != VERSION {
            return Err(TunnelError::InvalidFrame(format!(
                "Unsupported version: {}",
                buf[0]
            )));
        }
        let frame_type = FrameType::try_from(buf[1])?;
        let payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(4);
        let stream_id = buf.get_u32();
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
