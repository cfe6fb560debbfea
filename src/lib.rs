//! Generate a subvolume send stream: a replayable sequence of checksummed
//! commands that recreates a read-only snapshot on the receiving side.

pub mod config;
pub mod error;
#[cfg(unix)]
pub mod image;
pub mod send;
pub mod stream;
pub mod tree;

pub use config::SendConfig;
pub use error::{ErrorClass, Result, SendError};
pub use send::{send_to_vec, SendSession, SendStats, SendStream};
pub use stream::{decode_stream, DecodedCommand};
pub use tree::{Item, Key, MemoryTree, SubvolumeInfo, SubvolumeTree, TreeBuilder, TreeReader};
