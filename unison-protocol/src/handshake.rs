//! Handshake message sent by a connecting instance
//!
//! Body layout, all integers big-endian:
//!
//! ```text
//! [4 bytes]  channel name length
//! [n bytes]  channel name (ASCII)
//! [1 byte]   connection type
//! [4 bytes]  instance id
//! [2 bytes]  checksum over every preceding body byte
//! ```
//!
//! The checksum range starts at the name length prefix and stops just before
//! the checksum field itself; the frame header is never covered.

use bytes::{Buf, BufMut, BytesMut};

use crate::checksum::crc16;
use crate::codec::CodecError;

/// Fixed body bytes besides the channel name: name length prefix,
/// connection type, instance id, checksum.
pub const BODY_OVERHEAD: usize = 4 + 1 + 4 + 2;

/// Why a connecting instance opened its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    /// Unrecognized type byte. Still a valid connection, but never raises
    /// an instance-started event.
    Invalid = 0,
    /// An instance that was denied the primary role announcing itself.
    NewInstance = 1,
    /// A permitted secondary instance announcing itself.
    SecondaryInstance = 2,
    /// A secondary re-establishing its link purely to send a payload.
    Reconnect = 3,
}

impl ConnectionType {
    /// Map a raw wire byte to a connection type.
    ///
    /// Unknown values fold into `Invalid` rather than failing the
    /// handshake; the name and checksum checks decide validity.
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::NewInstance,
            2 => Self::SecondaryInstance,
            3 => Self::Reconnect,
            _ => Self::Invalid,
        }
    }
}

/// The initial message a client writes immediately after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Channel name as seen by the sender. The server only accepts the
    /// handshake when this matches its own channel name.
    pub channel_name: String,
    /// Why the sender connected.
    pub connection_type: ConnectionType,
    /// The sender's instance id.
    pub instance_id: u32,
}

impl Handshake {
    pub fn new(
        channel_name: impl Into<String>,
        connection_type: ConnectionType,
        instance_id: u32,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            connection_type,
            instance_id,
        }
    }

    /// Length of the encoded body in bytes.
    pub fn body_len(&self) -> usize {
        self.channel_name.len() + BODY_OVERHEAD
    }

    /// Encode the body (without the frame header) into `dst`.
    pub fn encode_body(&self, dst: &mut BytesMut) {
        let start = dst.len();

        dst.reserve(self.body_len());
        dst.put_u32(self.channel_name.len() as u32);
        dst.put_slice(self.channel_name.as_bytes());
        dst.put_u8(self.connection_type as u8);
        dst.put_u32(self.instance_id);

        let checksum = crc16(&dst[start..]);
        dst.put_u16(checksum);
    }

    /// Decode and validate a complete body.
    ///
    /// `body` must hold exactly the advertised body length. Any structural
    /// inconsistency or a checksum mismatch rejects the handshake.
    pub fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        if body.len() < BODY_OVERHEAD {
            return Err(CodecError::Malformed("body shorter than fixed fields"));
        }

        let expected = crc16(&body[..body.len() - 2]);

        let mut cursor = body;
        let name_len = cursor.get_u32() as usize;

        // The name must account for every byte between the prefix and the
        // trailing fixed fields.
        if name_len != body.len() - BODY_OVERHEAD {
            return Err(CodecError::Malformed("channel name length mismatch"));
        }

        let name_bytes = &cursor[..name_len];
        if !name_bytes.is_ascii() {
            return Err(CodecError::Malformed("channel name is not ASCII"));
        }
        let channel_name = String::from_utf8_lossy(name_bytes).into_owned();
        cursor.advance(name_len);

        let connection_type = ConnectionType::from_raw(cursor.get_u8());
        let instance_id = cursor.get_u32();
        let actual = cursor.get_u16();

        if actual != expected {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            channel_name,
            connection_type,
            instance_id,
        })
    }
}
