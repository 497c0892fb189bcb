// Frame codec for the master/worker and trigger channels.
//
// The wire format is a 4-byte little-endian body length followed by a JSON
// body. Frames larger than `MAX_FRAME_SIZE` are a protocol error that closes
// the connection.

use crate::constants::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Errors raised while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefixed JSON codec, typed on the decoded message.
///
/// Used as `FrameCodec<WorkerMessage>` on the master's worker listener,
/// `FrameCodec<MasterMessage>` on the worker side, and
/// `FrameCodec<TriggerMessage>` on the trigger listener. The encoder is
/// generic over any serializable message so each side answers on the same
/// framed stream.
pub struct FrameCodec<In> {
    _marker: PhantomData<In>,
}

impl<In> FrameCodec<In> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In> Default for FrameCodec<In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned> Decoder for FrameCodec<In> {
    type Item = In;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let body_len = u32::from_le_bytes(len_bytes) as usize;

        if body_len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(body_len));
        }

        if src.len() < 4 + body_len {
            // Reserve what the rest of the frame needs and wait for more.
            src.reserve(4 + body_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(body_len);
        let message = serde_json::from_slice(&body)?;
        Ok(Some(message))
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(body.len()));
        }

        dst.reserve(4 + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
