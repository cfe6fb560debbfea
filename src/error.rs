//! Send errors and their broad classes.

use crate::tree::Key;
use thiserror::Error;

/// Broad failure category, used by callers to decide how to report a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A source item was truncated or otherwise malformed.
    ProtocolInvariant,
    /// The read-only source changed underneath the traversal.
    Integrity,
    /// An internal record could not be held (oversized attribute, exhausted buffer).
    ResourceExhaustion,
    /// An extent uses an encoding this sender does not understand.
    Unsupported,
    /// The session could not start or was stopped from outside.
    Session,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("item {key} is {actual} bytes, expected at least {expected}")]
    ItemTooShort {
        key: Key,
        actual: usize,
        expected: usize,
    },

    #[error("item {key} was truncated: {reason}")]
    Truncated { key: Key, reason: String },

    #[error("read-only subvolume changed at {key}")]
    SubvolumeChanged { key: Key },

    #[error("could not find item {key}")]
    MissingItem { key: Key },

    #[error("item {key} precedes any inode item for {}", key.objectid)]
    NoInodeItem { key: Key },

    #[error("extent read failed at {address:#x}+{length}: {reason}")]
    ExtentRead {
        address: u64,
        length: usize,
        reason: String,
    },

    #[error("attribute of {len} bytes does not fit in a 16-bit length")]
    AttributeTooLarge { len: usize },

    #[error("unknown {what} {value} in item {key}")]
    Unsupported {
        key: Key,
        what: &'static str,
        value: u64,
    },

    #[error("send operation already running")]
    AlreadyRunning,

    #[error("invalid subvolume: {0}")]
    InvalidSubvolume(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("send stream aborted by consumer")]
    Aborted,

    #[error("malformed stream: {0}")]
    MalformedStream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SendError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SendError::ItemTooShort { .. }
            | SendError::Truncated { .. }
            | SendError::NoInodeItem { .. }
            | SendError::MalformedStream(_) => ErrorClass::ProtocolInvariant,
            SendError::SubvolumeChanged { .. }
            | SendError::MissingItem { .. }
            | SendError::ExtentRead { .. } => ErrorClass::Integrity,
            SendError::AttributeTooLarge { .. } => ErrorClass::ResourceExhaustion,
            SendError::Unsupported { .. } => ErrorClass::Unsupported,
            SendError::AlreadyRunning
            | SendError::InvalidSubvolume(_)
            | SendError::Config(_)
            | SendError::Aborted
            | SendError::Io(_) => ErrorClass::Session,
        }
    }

    pub(crate) fn truncated(key: Key, reason: impl Into<String>) -> Self {
        SendError::Truncated {
            key,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SendError>;
