//! unison-protocol: Wire definitions for instance-to-primary messaging
//!
//! This crate defines the handshake message a connecting instance sends to
//! the primary, the framing codec that parses it off a local socket, and the
//! 16-bit checksum shared by the wire protocol and the instance-state block.

pub mod checksum;
pub mod codec;
pub mod handshake;

// Re-export main types at crate root
pub use checksum::crc16;
pub use codec::{CodecError, HandshakeCodec};
pub use handshake::{ConnectionType, Handshake};

/// Size of the frame header: a u64 body length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Instance id sentinel for a process that was never assigned one.
pub const INSTANCE_UNASSIGNED: u32 = u32::MAX;
