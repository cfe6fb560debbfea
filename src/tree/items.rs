//! On-disk item payloads.
//!
//! All integers are little-endian. Parsers validate every declared length
//! against the item size before touching variable-length regions; the encoders
//! exist so fixtures and the directory imager can build trees.

use crate::error::{Result, SendError};
use crate::tree::Item;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

pub const EXTENT_TYPE_INLINE: u8 = 0;
pub const EXTENT_TYPE_REGULAR: u8 = 1;
pub const EXTENT_TYPE_PREALLOC: u8 = 2;

pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_ZLIB: u8 = 1;
pub const COMPRESSION_LZO: u8 = 2;
pub const COMPRESSION_ZSTD: u8 = 3;

pub const ENCRYPTION_NONE: u8 = 0;
pub const ENCODING_NONE: u16 = 0;

fn require(item: &Item, expected: usize) -> Result<()> {
    if item.len() < expected {
        return Err(SendError::ItemTooShort {
            key: item.key,
            actual: item.len(),
            expected,
        });
    }
    Ok(())
}

// =============================================================================
// Timestamps
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

impl Timespec {
    pub const SIZE: usize = 12;

    pub const fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.sec.to_le_bytes());
        out[8..].copy_from_slice(&self.nsec.to_le_bytes());
        out
    }

    pub fn from_slice(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            sec: buf.get_u64_le(),
            nsec: buf.get_u32_le(),
        })
    }

    fn put(self, buf: &mut BytesMut) {
        buf.put_u64_le(self.sec);
        buf.put_u32_le(self.nsec);
    }
}

/// Access, modification and change times of one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Times {
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

// =============================================================================
// Inode item
// =============================================================================

/// File kinds distinguished by the `S_IFMT` bits of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Socket,
    Symlink,
    Device,
    Directory,
    Fifo,
    Regular,
}

impl FileKind {
    /// Anything that is not one of the special types is treated as a regular file.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFSOCK => FileKind::Socket,
            S_IFLNK => FileKind::Symlink,
            S_IFCHR | S_IFBLK => FileKind::Device,
            S_IFDIR => FileKind::Directory,
            S_IFIFO => FileKind::Fifo,
            _ => FileKind::Regular,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub otime: Timespec,
}

impl InodeItem {
    pub const SIZE: usize = 160;

    pub fn parse(item: &Item) -> Result<Self> {
        require(item, Self::SIZE)?;
        let mut buf = &item.data[..];
        let generation = buf.get_u64_le();
        let transid = buf.get_u64_le();
        let size = buf.get_u64_le();
        let nbytes = buf.get_u64_le();
        let block_group = buf.get_u64_le();
        let nlink = buf.get_u32_le();
        let uid = buf.get_u32_le();
        let gid = buf.get_u32_le();
        let mode = buf.get_u32_le();
        let rdev = buf.get_u64_le();
        let flags = buf.get_u64_le();
        let sequence = buf.get_u64_le();
        buf.advance(32); // reserved
        let mut time = || {
            let sec = buf.get_u64_le();
            let nsec = buf.get_u32_le();
            Timespec { sec, nsec }
        };
        let atime = time();
        let ctime = time();
        let mtime = time();
        let otime = time();

        Ok(Self {
            generation,
            transid,
            size,
            nbytes,
            block_group,
            nlink,
            uid,
            gid,
            mode,
            rdev,
            flags,
            sequence,
            atime,
            ctime,
            mtime,
            otime,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.generation);
        buf.put_u64_le(self.transid);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.nbytes);
        buf.put_u64_le(self.block_group);
        buf.put_u32_le(self.nlink);
        buf.put_u32_le(self.uid);
        buf.put_u32_le(self.gid);
        buf.put_u32_le(self.mode);
        buf.put_u64_le(self.rdev);
        buf.put_u64_le(self.flags);
        buf.put_u64_le(self.sequence);
        buf.put_bytes(0, 32);
        self.atime.put(&mut buf);
        self.ctime.put(&mut buf);
        self.mtime.put(&mut buf);
        self.otime.put(&mut buf);
        buf.freeze()
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn times(&self) -> Times {
        Times {
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

// =============================================================================
// Inode references
// =============================================================================

/// One name of an inode, together with the directory that holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRef {
    pub parent: u64,
    pub index: u64,
    pub name: Bytes,
}

const INODE_REF_HEADER: usize = 10;
const INODE_EXTREF_HEADER: usize = 18;

/// Parse a short-form reference item. The parent comes from the key offset.
pub fn parse_inode_refs(item: &Item) -> Result<Vec<NameRef>> {
    require(item, INODE_REF_HEADER)?;
    let mut refs = Vec::new();
    let mut pos = 0;
    while pos < item.len() {
        let mut buf = &item.data[pos..];
        if buf.len() < INODE_REF_HEADER {
            return Err(SendError::truncated(item.key, "inode ref header"));
        }
        let index = buf.get_u64_le();
        let name_len = buf.get_u16_le() as usize;
        let start = pos + INODE_REF_HEADER;
        if item.len() < start + name_len {
            return Err(SendError::truncated(
                item.key,
                format!("inode ref name of {} bytes", name_len),
            ));
        }
        refs.push(NameRef {
            parent: item.key.offset,
            index,
            name: item.data.slice(start..start + name_len),
        });
        pos = start + name_len;
    }
    Ok(refs)
}

/// Parse an extended reference item, where every entry names its own parent.
pub fn parse_inode_extrefs(item: &Item) -> Result<Vec<NameRef>> {
    require(item, INODE_EXTREF_HEADER)?;
    let mut refs = Vec::new();
    let mut pos = 0;
    while pos < item.len() {
        let mut buf = &item.data[pos..];
        if buf.len() < INODE_EXTREF_HEADER {
            return Err(SendError::truncated(item.key, "inode extref header"));
        }
        let parent = buf.get_u64_le();
        let index = buf.get_u64_le();
        let name_len = buf.get_u16_le() as usize;
        let start = pos + INODE_EXTREF_HEADER;
        if item.len() < start + name_len {
            return Err(SendError::truncated(
                item.key,
                format!("inode extref name of {} bytes", name_len),
            ));
        }
        refs.push(NameRef {
            parent,
            index,
            name: item.data.slice(start..start + name_len),
        });
        pos = start + name_len;
    }
    Ok(refs)
}

pub fn encode_inode_ref(entries: &[(u64, &[u8])]) -> Bytes {
    let mut buf = BytesMut::new();
    for (index, name) in entries {
        buf.put_u64_le(*index);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
    }
    buf.freeze()
}

pub fn encode_inode_extref(entries: &[(u64, u64, &[u8])]) -> Bytes {
    let mut buf = BytesMut::new();
    for (parent, index, name) in entries {
        buf.put_u64_le(*parent);
        buf.put_u64_le(*index);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
    }
    buf.freeze()
}

// =============================================================================
// File extents
// =============================================================================

/// Fixed prefix shared by every file extent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtentHeader {
    pub generation: u64,
    /// Decoded (uncompressed) size of the extent.
    pub ram_bytes: u64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: u16,
    pub extent_type: u8,
}

impl FileExtentHeader {
    pub const SIZE: usize = 21;

    pub fn parse(item: &Item) -> Result<Self> {
        require(item, Self::SIZE)?;
        let mut buf = &item.data[..];
        Ok(Self {
            generation: buf.get_u64_le(),
            ram_bytes: buf.get_u64_le(),
            compression: buf.get_u8(),
            encryption: buf.get_u8(),
            other_encoding: buf.get_u16_le(),
            extent_type: buf.get_u8(),
        })
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.generation);
        buf.put_u64_le(self.ram_bytes);
        buf.put_u8(self.compression);
        buf.put_u8(self.encryption);
        buf.put_u16_le(self.other_encoding);
        buf.put_u8(self.extent_type);
    }
}

/// Content stored directly in the item, `ram_bytes` long.
pub fn inline_data(item: &Item, header: &FileExtentHeader) -> Result<Bytes> {
    let len = usize::try_from(header.ram_bytes).unwrap_or(usize::MAX);
    let end = FileExtentHeader::SIZE.saturating_add(len);
    if item.len() < end {
        return Err(SendError::ItemTooShort {
            key: item.key,
            actual: item.len(),
            expected: end,
        });
    }
    Ok(item.data.slice(FileExtentHeader::SIZE..end))
}

/// Location of out-of-line extent content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegularExtent {
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    /// Offset into the on-disk extent where this file's data starts.
    pub offset: u64,
    /// Number of bytes of the extent referenced by the file.
    pub num_bytes: u64,
}

impl RegularExtent {
    pub const SIZE: usize = FileExtentHeader::SIZE + 32;

    pub fn parse(item: &Item) -> Result<Self> {
        require(item, Self::SIZE)?;
        let mut buf = &item.data[FileExtentHeader::SIZE..];
        Ok(Self {
            disk_bytenr: buf.get_u64_le(),
            disk_num_bytes: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            num_bytes: buf.get_u64_le(),
        })
    }

    /// Holes are recorded as extents without backing storage.
    pub fn is_hole(&self) -> bool {
        self.disk_bytenr == 0 || self.disk_num_bytes == 0
    }
}

pub fn encode_inline_extent(generation: u64, compression: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FileExtentHeader::SIZE + data.len());
    FileExtentHeader {
        generation,
        ram_bytes: data.len() as u64,
        compression,
        encryption: ENCRYPTION_NONE,
        other_encoding: ENCODING_NONE,
        extent_type: EXTENT_TYPE_INLINE,
    }
    .put(&mut buf);
    buf.put_slice(data);
    buf.freeze()
}

pub fn encode_regular_extent(
    header: FileExtentHeader,
    extent: RegularExtent,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(RegularExtent::SIZE);
    header.put(&mut buf);
    buf.put_u64_le(extent.disk_bytenr);
    buf.put_u64_le(extent.disk_num_bytes);
    buf.put_u64_le(extent.offset);
    buf.put_u64_le(extent.num_bytes);
    buf.freeze()
}

// =============================================================================
// Extended attributes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    pub name: Bytes,
    pub value: Bytes,
}

/// location key (17) + transid (8) + data_len (2) + name_len (2) + type (1)
const DIR_ITEM_HEADER: usize = 30;
const FT_XATTR: u8 = 8;

/// Parse every name/value pair packed into an xattr item, in stored order.
pub fn parse_xattrs(item: &Item) -> Result<Vec<XattrEntry>> {
    require(item, DIR_ITEM_HEADER)?;
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < item.len() {
        let mut buf = &item.data[pos..];
        if buf.len() < DIR_ITEM_HEADER {
            return Err(SendError::truncated(item.key, "xattr header"));
        }
        buf.advance(17 + 8);
        let data_len = buf.get_u16_le() as usize;
        let name_len = buf.get_u16_le() as usize;
        let name_start = pos + DIR_ITEM_HEADER;
        let value_start = name_start + name_len;
        let end = value_start + data_len;
        if item.len() < end {
            return Err(SendError::truncated(
                item.key,
                format!("xattr with {} byte name and {} byte value", name_len, data_len),
            ));
        }
        entries.push(XattrEntry {
            name: item.data.slice(name_start..value_start),
            value: item.data.slice(value_start..end),
        });
        pos = end;
    }
    Ok(entries)
}

pub fn encode_xattrs(entries: &[(&[u8], &[u8])]) -> Bytes {
    let mut buf = BytesMut::new();
    for (name, value) in entries {
        buf.put_bytes(0, 17);
        buf.put_u64_le(0);
        buf.put_u16_le(value.len() as u16);
        buf.put_u16_le(name.len() as u16);
        buf.put_u8(FT_XATTR);
        buf.put_slice(name);
        buf.put_slice(value);
    }
    buf.freeze()
}
