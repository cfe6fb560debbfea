//! Send stream wire format.
//!
//! Architecture:
//! ```text
//! traversal ──► CommandEncoder (BytesMut) ──► SendStream ──► writer
//!                      │
//!                      └── stream header, TLV commands, CRC32C per command
//! ```
//!
//! `dump` is the inverse, used to inspect and verify a finished stream.

pub mod dump;
pub mod encoder;
pub mod protocol;

pub use dump::{decode_stream, DecodedAttribute, DecodedCommand};
pub use encoder::{CommandEncoder, CommandMark};
pub use protocol::{Attribute, Command, STREAM_MAGIC, STREAM_VERSION};
