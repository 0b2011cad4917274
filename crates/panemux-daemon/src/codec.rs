//! Length-prefixed JSON framing for the IPC socket.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::IpcMessage;

/// Maximum frame size (4 MB). A full state snapshot fits comfortably.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Codec used by both sides of the socket.
#[derive(Debug, Default)]
pub struct IpcCodec;

impl IpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for IpcCodec {
    type Item = IpcMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix.
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length without consuming.
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let data = src.split_to(len);
        let msg: IpcMessage = serde_json::from_slice(&data)?;
        Ok(Some(msg))
    }
}

impl Encoder<IpcMessage> for IpcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: IpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = serde_json::to_vec(&item)?;
        if data.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(4 + data.len());
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);
        Ok(())
    }
}
