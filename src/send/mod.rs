//! Send engine: walks a subvolume tree and emits the command stream.
//!
//! The traversal is synchronous and runs on a blocking thread; a
//! [`SendSession`] hands its output to an async consumer one buffer at a time.

mod content;
mod inode;
mod names;
pub mod registry;
pub mod session;
pub mod traversal;

pub use registry::{DirectoryRegistry, OrphanRegistry};
pub use session::{SendSession, SendStream, StreamEvent};
pub use traversal::{begin_stream, check_sendable, send_to_vec, SendStats, StreamSink, Traversal};
