//! Length-prefixed typed frames.
//!
//! ```text
//! [ size: u32 BE ][ frame type: i32 BE ][ data ... ]
//!   size = 4 + len(data)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a frame we are willing to read back.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame types carried in the second header word.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl FrameType {
    /// Decode the wire value of a frame type.
    pub fn from_wire(val: i32) -> Result<Self, FrameError> {
        match val {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Errors produced while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame type {0}")]
    UnknownType(i32),

    #[error("invalid frame size {0}")]
    InvalidSize(usize),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type,
            data: data.into(),
        }
    }

    pub fn response(data: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Response, data)
    }

    pub fn error(data: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Error, data)
    }
}

/// Codec for [`Frame`]s, for use with `tokio_util::codec::Framed*`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.data.len() + 4;
        if size > MAX_FRAME_SIZE as usize {
            return Err(FrameError::InvalidSize(size));
        }

        dst.reserve(size + 4);
        dst.put_u32(size as u32);
        dst.put_i32(item.frame_type as i32);
        dst.extend_from_slice(&item.data);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the size without consuming it.
        let size = (&src[..4]).get_u32();
        if !(4..=MAX_FRAME_SIZE).contains(&size) {
            return Err(FrameError::InvalidSize(size as usize));
        }

        let total = size as usize + 4;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(4);
        let frame_type = FrameType::from_wire(frame.get_i32())?;
        Ok(Some(Frame {
            frame_type,
            data: frame.to_vec(),
        }))
    }
}
