//! Read-side view of a subvolume's metadata tree.
//!
//! The send engine never owns storage. It walks items in ascending
//! `(objectid, type, offset)` order through [`TreeReader`], and reads extent
//! content by address. A reader represents one uninterrupted scan segment:
//! implementations hold their shared (read) lock for as long as the reader is
//! alive, and the traversal drops it across every suspension.

pub mod items;
pub mod memory;

pub use memory::{MemoryTree, TreeBuilder};

use crate::error::Result;
use bytes::Bytes;
use std::fmt;

/// Inode number of every subvolume's root directory.
pub const SUBVOL_ROOT_INODE: u64 = 256;

/// Objectid of the top-level filesystem tree, which is not a sendable subvolume.
pub const FS_TREE_OBJECTID: u64 = 5;

pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const INODE_EXTREF_KEY: u8 = 13;
pub const XATTR_ITEM_KEY: u8 = 24;
pub const DIR_ITEM_KEY: u8 = 84;
pub const DIR_INDEX_KEY: u8 = 96;
pub const EXTENT_DATA_KEY: u8 = 108;

/// Position of an item in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.objectid, self.item_type, self.offset)
    }
}

/// A leaf item: key plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Key,
    pub data: Bytes,
}

impl Item {
    pub fn new(key: Key, data: impl Into<Bytes>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Identity of the subvolume being sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubvolumeInfo {
    /// Name written into the subvolume-begin command.
    pub name: String,
    /// Tree objectid of the subvolume.
    pub root_id: u64,
    pub uuid: [u8; 16],
    /// UUID of the subvolume this one was received from, if any.
    pub received_uuid: [u8; 16],
    pub ctransid: u64,
    /// Non-zero when the subvolume was itself created by a receive.
    pub rtransid: u64,
    pub read_only: bool,
}

impl SubvolumeInfo {
    /// UUID a receiver should record for the new subvolume.
    pub fn stream_uuid(&self) -> [u8; 16] {
        if self.rtransid == 0 {
            self.uuid
        } else {
            self.received_uuid
        }
    }
}

/// Ordered lookup over one locked scan segment.
pub trait TreeReader {
    /// First item with a key greater than or equal to `key`.
    fn find_item(&self, key: &Key) -> Result<Option<Item>>;

    /// First item with a key strictly greater than `key`.
    fn next_item(&self, key: &Key) -> Result<Option<Item>>;

    /// Raw content of `length` bytes at logical `address`.
    fn read_extent(&self, address: u64, length: usize) -> Result<Bytes>;

    /// Exact lookup.
    fn get_item(&self, key: &Key) -> Result<Option<Item>> {
        Ok(self.find_item(key)?.filter(|item| item.key == *key))
    }
}

/// A subvolume that can hand out shared-lock readers.
pub trait SubvolumeTree: Send + Sync + 'static {
    type Reader<'a>: TreeReader
    where
        Self: 'a;

    fn info(&self) -> &SubvolumeInfo;

    /// Acquire the shared lock and return a reader over the current tree.
    fn reader(&self) -> Result<Self::Reader<'_>>;
}
