//! In-memory subvolume tree.
//!
//! `MemoryTree` keeps items in a `BTreeMap` behind an `RwLock` and extent
//! content in a sparse byte "device". Readers hold the shared lock for their
//! lifetime, so writers (tests simulating a mutated snapshot) block until the
//! traversal suspends.

use crate::error::{Result, SendError};
use crate::stream::protocol::crc32c;
use crate::tree::items::{
    encode_inline_extent, encode_inode_extref, encode_inode_ref, encode_regular_extent,
    encode_xattrs, FileExtentHeader, InodeItem, RegularExtent, Timespec, COMPRESSION_NONE,
    ENCODING_NONE, ENCRYPTION_NONE, EXTENT_TYPE_REGULAR, S_IFDIR, S_IFLNK, S_IFREG,
};
use crate::tree::{
    Item, Key, SubvolumeInfo, SubvolumeTree, TreeReader, EXTENT_DATA_KEY, INODE_EXTREF_KEY,
    INODE_ITEM_KEY, INODE_REF_KEY, SUBVOL_ROOT_INODE, XATTR_ITEM_KEY,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard};

/// Sector size used when laying out extents on the device.
pub const SECTOR_SIZE: u64 = 4096;

/// First logical address handed out for extent data.
const DEVICE_START: u64 = 1 << 20;

pub struct MemoryTree {
    info: SubvolumeInfo,
    items: RwLock<BTreeMap<Key, Bytes>>,
    device: RwLock<BTreeMap<u64, Bytes>>,
}

impl MemoryTree {
    pub fn new(info: SubvolumeInfo) -> Self {
        Self {
            info,
            items: RwLock::new(BTreeMap::new()),
            device: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert or replace an item.
    pub fn insert_item(&self, key: Key, data: impl Into<Bytes>) {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.insert(key, data.into());
    }

    pub fn remove_item(&self, key: &Key) -> Option<Bytes> {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.remove(key)
    }

    /// Place content at a logical device address.
    pub fn write_device(&self, address: u64, data: impl Into<Bytes>) {
        let mut device = self.device.write().unwrap_or_else(|e| e.into_inner());
        device.insert(address, data.into());
    }

    pub fn item_count(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Debug for MemoryTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTree")
            .field("name", &self.info.name)
            .field("item_count", &self.item_count())
            .finish()
    }
}

pub struct MemoryReader<'a> {
    items: RwLockReadGuard<'a, BTreeMap<Key, Bytes>>,
    device: RwLockReadGuard<'a, BTreeMap<u64, Bytes>>,
}

impl TreeReader for MemoryReader<'_> {
    fn find_item(&self, key: &Key) -> Result<Option<Item>> {
        Ok(self
            .items
            .range(key..)
            .next()
            .map(|(k, v)| Item::new(*k, v.clone())))
    }

    fn next_item(&self, key: &Key) -> Result<Option<Item>> {
        Ok(self
            .items
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| Item::new(*k, v.clone())))
    }

    fn read_extent(&self, address: u64, length: usize) -> Result<Bytes> {
        let fail = |reason: &str| SendError::ExtentRead {
            address,
            length,
            reason: reason.to_string(),
        };
        let (start, chunk) = self
            .device
            .range(..=address)
            .next_back()
            .ok_or_else(|| fail("no extent at address"))?;
        let from = (address - start) as usize;
        let to = from
            .checked_add(length)
            .ok_or_else(|| fail("length overflow"))?;
        if to > chunk.len() {
            return Err(fail("read past end of extent"));
        }
        Ok(chunk.slice(from..to))
    }
}

impl SubvolumeTree for MemoryTree {
    type Reader<'a> = MemoryReader<'a>;

    fn info(&self) -> &SubvolumeInfo {
        &self.info
    }

    fn reader(&self) -> Result<MemoryReader<'_>> {
        Ok(MemoryReader {
            items: self.items.read().unwrap_or_else(|e| e.into_inner()),
            device: self.device.read().unwrap_or_else(|e| e.into_inner()),
        })
    }
}

// =============================================================================
// TreeBuilder
// =============================================================================

/// Builds a consistent subvolume tree with explicit inode numbers.
///
/// Directory sizes and link counts are derived at `build()` time, the way the
/// filesystem maintains them (directory size = twice the sum of entry name
/// lengths).
pub struct TreeBuilder {
    info: SubvolumeInfo,
    inodes: BTreeMap<u64, InodeItem>,
    names: BTreeMap<(u64, u64), Vec<Bytes>>,
    items: Vec<(Key, Bytes)>,
    device: Vec<(u64, Bytes)>,
    next_bytenr: u64,
    next_index: u64,
    max_inline: usize,
    max_extent: usize,
    use_extrefs: bool,
}

impl TreeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut builder = Self {
            info: SubvolumeInfo {
                name: name.into(),
                root_id: 257,
                uuid: [0x11; 16],
                received_uuid: [0; 16],
                ctransid: 1,
                rtransid: 0,
                read_only: true,
            },
            inodes: BTreeMap::new(),
            names: BTreeMap::new(),
            items: Vec::new(),
            device: Vec::new(),
            next_bytenr: DEVICE_START,
            next_index: 2,
            max_inline: 2048,
            max_extent: 128 * 1024,
            use_extrefs: false,
        };
        builder.inodes.insert(
            SUBVOL_ROOT_INODE,
            Self::new_inode(S_IFDIR | 0o755, 0),
        );
        builder
    }

    fn new_inode(mode: u32, size: u64) -> InodeItem {
        InodeItem {
            generation: 1,
            transid: 1,
            size,
            nlink: 1,
            mode,
            atime: Timespec::new(1_700_000_000, 0),
            ctime: Timespec::new(1_700_000_000, 0),
            mtime: Timespec::new(1_700_000_000, 0),
            otime: Timespec::new(1_700_000_000, 0),
            ..Default::default()
        }
    }

    pub fn info_mut(&mut self) -> &mut SubvolumeInfo {
        &mut self.info
    }

    /// Largest file stored inline instead of in a device extent.
    pub fn max_inline(mut self, bytes: usize) -> Self {
        self.max_inline = bytes;
        self
    }

    /// Largest single extent written for a file's content.
    pub fn max_extent(mut self, bytes: usize) -> Self {
        self.max_extent = bytes.max(1);
        self
    }

    /// Record names as extended refs (one item per name) instead of short refs.
    pub fn use_extrefs(mut self, enabled: bool) -> Self {
        self.use_extrefs = enabled;
        self
    }

    /// Mutate an inode added earlier. Unknown inodes are ignored.
    pub fn inode(&mut self, ino: u64, f: impl FnOnce(&mut InodeItem)) -> &mut Self {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            f(inode);
        }
        self
    }

    fn link(&mut self, ino: u64, parent: u64, name: &[u8]) {
        self.names
            .entry((ino, parent))
            .or_default()
            .push(Bytes::copy_from_slice(name));
    }

    pub fn dir(&mut self, ino: u64, parent: u64, name: impl AsRef<[u8]>) -> &mut Self {
        self.inodes.insert(ino, Self::new_inode(S_IFDIR | 0o755, 0));
        self.link(ino, parent, name.as_ref());
        self
    }

    pub fn file(&mut self, ino: u64, parent: u64, name: impl AsRef<[u8]>, data: &[u8]) -> &mut Self {
        self.inodes
            .insert(ino, Self::new_inode(S_IFREG | 0o644, data.len() as u64));
        self.link(ino, parent, name.as_ref());
        if data.is_empty() {
            return self;
        }
        if data.len() <= self.max_inline {
            let payload = encode_inline_extent(1, COMPRESSION_NONE, data);
            self.items
                .push((Key::new(ino, EXTENT_DATA_KEY, 0), payload));
        } else {
            let chunk = self.max_extent;
            for (i, part) in data.chunks(chunk).enumerate() {
                self.regular_extent(ino, (i * chunk) as u64, part);
            }
        }
        self
    }

    /// Write `data` to a fresh device extent referenced at `file_offset`.
    /// The on-disk extent is padded to a whole sector, as the filesystem does.
    pub fn regular_extent(&mut self, ino: u64, file_offset: u64, data: &[u8]) -> &mut Self {
        let padded = (data.len() as u64).div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        let mut content = data.to_vec();
        content.resize(padded as usize, 0);

        let bytenr = self.next_bytenr;
        self.next_bytenr += padded;
        self.device.push((bytenr, Bytes::from(content)));

        let header = FileExtentHeader {
            generation: 1,
            ram_bytes: padded,
            compression: COMPRESSION_NONE,
            encryption: ENCRYPTION_NONE,
            other_encoding: ENCODING_NONE,
            extent_type: EXTENT_TYPE_REGULAR,
        };
        let extent = RegularExtent {
            disk_bytenr: bytenr,
            disk_num_bytes: padded,
            offset: 0,
            num_bytes: padded,
        };
        self.items.push((
            Key::new(ino, EXTENT_DATA_KEY, file_offset),
            encode_regular_extent(header, extent),
        ));
        self
    }

    pub fn symlink(
        &mut self,
        ino: u64,
        parent: u64,
        name: impl AsRef<[u8]>,
        target: impl AsRef<[u8]>,
    ) -> &mut Self {
        let target = target.as_ref();
        self.inodes
            .insert(ino, Self::new_inode(S_IFLNK | 0o777, target.len() as u64));
        self.link(ino, parent, name.as_ref());
        self.items.push((
            Key::new(ino, EXTENT_DATA_KEY, 0),
            encode_inline_extent(1, COMPRESSION_NONE, target),
        ));
        self
    }

    /// Device nodes, FIFOs and sockets.
    pub fn special(
        &mut self,
        ino: u64,
        parent: u64,
        name: impl AsRef<[u8]>,
        mode: u32,
        rdev: u64,
    ) -> &mut Self {
        let mut inode = Self::new_inode(mode, 0);
        inode.rdev = rdev;
        self.inodes.insert(ino, inode);
        self.link(ino, parent, name.as_ref());
        self
    }

    /// Add another name for an existing inode.
    pub fn hardlink(&mut self, ino: u64, parent: u64, name: impl AsRef<[u8]>) -> &mut Self {
        self.link(ino, parent, name.as_ref());
        self
    }

    pub fn xattr(&mut self, ino: u64, name: impl AsRef<[u8]>, value: &[u8]) -> &mut Self {
        let name = name.as_ref();
        let offset = u64::from(crc32c(0, name));
        self.items.push((
            Key::new(ino, XATTR_ITEM_KEY, offset),
            encode_xattrs(&[(name, value)]),
        ));
        self
    }

    /// Insert a raw item, overriding anything the builder would generate.
    pub fn raw_item(&mut self, key: Key, data: impl Into<Bytes>) -> &mut Self {
        self.items.push((key, data.into()));
        self
    }

    pub fn device(&mut self, address: u64, data: impl Into<Bytes>) -> &mut Self {
        self.device.push((address, data.into()));
        self
    }

    pub fn build(&self) -> MemoryTree {
        let tree = MemoryTree::new(self.info.clone());

        let mut dir_sizes: BTreeMap<u64, u64> = BTreeMap::new();
        let mut link_counts: BTreeMap<u64, u32> = BTreeMap::new();
        for ((ino, parent), names) in &self.names {
            for name in names {
                *dir_sizes.entry(*parent).or_default() += 2 * name.len() as u64;
            }
            *link_counts.entry(*ino).or_default() += names.len() as u32;
        }

        for (ino, inode) in &self.inodes {
            let mut inode = inode.clone();
            if inode.kind() == crate::tree::items::FileKind::Directory {
                inode.size = dir_sizes.get(ino).copied().unwrap_or(0);
            } else if let Some(n) = link_counts.get(ino) {
                inode.nlink = *n;
            }
            tree.insert_item(Key::new(*ino, INODE_ITEM_KEY, 0), inode.encode());
        }

        tree.insert_item(
            Key::new(SUBVOL_ROOT_INODE, INODE_REF_KEY, SUBVOL_ROOT_INODE),
            encode_inode_ref(&[(0, b"..")]),
        );

        let mut index = self.next_index;
        for ((ino, parent), names) in &self.names {
            if self.use_extrefs {
                for name in names {
                    let mut hashed = parent.to_le_bytes().to_vec();
                    hashed.extend_from_slice(name);
                    let offset = u64::from(crc32c(0, &hashed));
                    tree.insert_item(
                        Key::new(*ino, INODE_EXTREF_KEY, offset),
                        encode_inode_extref(&[(*parent, index, &name[..])]),
                    );
                    index += 1;
                }
            } else {
                let entries: Vec<(u64, &[u8])> = names
                    .iter()
                    .map(|name| {
                        index += 1;
                        (index - 1, &name[..])
                    })
                    .collect();
                tree.insert_item(
                    Key::new(*ino, INODE_REF_KEY, *parent),
                    encode_inode_ref(&entries),
                );
            }
        }

        for (key, data) in &self.items {
            tree.insert_item(*key, data.clone());
        }
        for (address, data) in &self.device {
            tree.write_device(*address, data.clone());
        }
        tree
    }
}
