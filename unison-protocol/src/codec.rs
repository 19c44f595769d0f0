//! Framing codec for the instance handshake
//!
//! The stream starts with an 8-byte length header followed by the handshake
//! body. The decoder tracks the header/body stage across partial reads, so
//! it can be driven by a non-blocking socket delivering arbitrary chunks.
//! Everything after a decoded handshake is application payload and is read
//! off the socket raw, not through this codec.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::handshake::Handshake;
use crate::FRAME_HEADER_LEN;

/// Maximum accepted handshake body size (64 KiB).
///
/// Real bodies are a hashed channel name plus eleven fixed bytes; anything
/// near this bound is a stale or hostile peer.
const MAX_BODY_LEN: u64 = 64 * 1024;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Malformed handshake: {0}")]
    Malformed(&'static str),

    #[error("Handshake checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
}

/// Framing stage of one inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the 8-byte length header.
    Header,
    /// Waiting for the full body of the given length.
    Body(usize),
}

/// Decoder for the initial handshake frame, encoder for outbound handshakes.
#[derive(Debug)]
pub struct HandshakeCodec {
    stage: Stage,
}

impl HandshakeCodec {
    pub fn new() -> Self {
        Self {
            stage: Stage::Header,
        }
    }
}

impl Default for HandshakeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Stage::Header = self.stage {
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }

            let body_len = src.get_u64();
            if body_len > MAX_BODY_LEN {
                return Err(CodecError::TooLarge {
                    size: body_len,
                    max: MAX_BODY_LEN,
                });
            }

            self.stage = Stage::Body(body_len as usize);
        }

        let Stage::Body(body_len) = self.stage else {
            unreachable!();
        };

        if src.len() < body_len {
            // Reserve space for the rest of the body
            src.reserve(body_len - src.len());
            return Ok(None);
        }

        let body = src.split_to(body_len);
        let handshake = Handshake::decode_body(&body)?;

        // Any bytes left in `src` are application payload for the caller.
        self.stage = Stage::Header;
        Ok(Some(handshake))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_HEADER_LEN + item.body_len());
        dst.put_u64(item.body_len() as u64);
        item.encode_body(dst);
        Ok(())
    }
}
