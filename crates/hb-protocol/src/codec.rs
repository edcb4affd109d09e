//! Tokio codec for newline-delimited JSON messages

use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Maximum size of a single encoded frame (one JSON line).
///
/// File contents travel inside a single frame, so the cap is generous; a
/// line growing past it indicates a peer that is not speaking this protocol.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec for one-JSON-object-per-line framing.
///
/// `M` is the inbound message type; any serializable message can be encoded
/// outbound, so one codec serves both directions of a connection.
#[derive(Debug)]
pub struct JsonLineCodec<M> {
    /// Offset into the buffer already scanned for a newline
    next_index: usize,
    _marker: PhantomData<M>,
}

impl<M> JsonLineCodec<M> {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            next_index: 0,
            _marker: PhantomData,
        }
    }
}

impl<M> Default for JsonLineCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: DeserializeOwned> Decoder for JsonLineCodec<M> {
    type Item = M;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                // Remember how far we scanned so the next call resumes there
                self.next_index = src.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            let line = src.split_to(end + 1);
            self.next_index = 0;

            let mut line = &line[..line.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_slice(line)?));
        }
    }
}

impl<M, T: Serialize> Encoder<T> for JsonLineCodec<M> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}
