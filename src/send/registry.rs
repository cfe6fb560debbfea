//! Orphan and directory registries.
//!
//! Both are keyed by inode number and iterate in ascending inode order. Each
//! entry is owned by its registry until removed.

use crate::tree::items::Times;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Placeholder name for an inode created before its real name is known.
///
/// The trailing index is always 0: two placeholders for the same
/// `(inode, generation)` would collide.
pub fn synthesize_name(inode: u64, generation: u64) -> Bytes {
    Bytes::from(format!("o{}-{}-{}", inode, generation, 0))
}

/// `parent + "/" + name`
pub fn join_path(parent: &[u8], name: &[u8]) -> Bytes {
    let mut path = BytesMut::with_capacity(parent.len() + 1 + name.len());
    path.put_slice(parent);
    path.put_u8(b'/');
    path.put_slice(name);
    path.freeze()
}

// =============================================================================
// Orphan Registry
// =============================================================================

/// An inode that exists in the output under a placeholder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanEntry {
    pub inode: u64,
    /// Directory with children: promoted to the directory registry once named.
    pub is_dir: bool,
    pub placeholder: Bytes,
}

#[derive(Debug, Default)]
pub struct OrphanRegistry {
    entries: BTreeMap<u64, OrphanEntry>,
}

impl OrphanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one entry per inode; a second insert replaces the first.
    pub fn insert(&mut self, entry: OrphanEntry) -> Option<OrphanEntry> {
        self.entries.insert(entry.inode, entry)
    }

    pub fn find(&self, inode: u64) -> Option<&OrphanEntry> {
        self.entries.get(&inode)
    }

    pub fn remove(&mut self, inode: u64) -> Option<OrphanEntry> {
        self.entries.remove(&inode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrphanEntry> {
        self.entries.values()
    }
}

// =============================================================================
// Directory Registry
// =============================================================================

/// A directory whose final path is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub inode: u64,
    pub path: Bytes,
    pub times: Times,
}

#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    entries: BTreeMap<u64, DirectoryEntry>,
}

impl DirectoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, inode: u64, path: Bytes, times: Times) {
        self.entries
            .insert(inode, DirectoryEntry { inode, path, times });
    }

    pub fn find(&self, inode: u64) -> Option<&DirectoryEntry> {
        self.entries.get(&inode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite every path below `from/` to sit below `to/` instead.
    /// Returns the number of entries moved.
    pub fn rebase(&mut self, from: &[u8], to: &[u8]) -> usize {
        let mut moved = 0;
        for entry in self.entries.values_mut() {
            let path = &entry.path;
            if path.len() > from.len() && path.starts_with(from) && path[from.len()] == b'/' {
                let mut rebased = BytesMut::with_capacity(to.len() + path.len() - from.len());
                rebased.put_slice(to);
                rebased.put_slice(&path[from.len()..]);
                entry.path = rebased.freeze();
                moved += 1;
            }
        }
        moved
    }
}
