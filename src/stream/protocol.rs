//! Send stream wire constants.
//!
//! Wire format: all integers are little-endian.
//! Header:  magic (13 bytes) | version:u32
//! Command: len:u32 | cmd:u16 | crc:u32 | attributes
//! Attribute: type:u16 | len:u16 | payload

/// Stream magic, including the trailing NUL.
pub const STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";

/// Stream format version.
pub const STREAM_VERSION: u32 = 1;

/// Magic plus version.
pub const STREAM_HEADER_SIZE: usize = STREAM_MAGIC.len() + 4;

/// len + cmd + crc
pub const COMMAND_HEADER_SIZE: usize = 10;

/// type + len
pub const ATTRIBUTE_HEADER_SIZE: usize = 4;

/// Byte offset of the crc field inside a command header.
pub const CRC_OFFSET: usize = 6;

// =============================================================================
// Command Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Subvol = 1,
    Snapshot = 2,
    Mkfile = 3,
    Mkdir = 4,
    Mknod = 5,
    Mkfifo = 6,
    Mksock = 7,
    Symlink = 8,
    Rename = 9,
    Link = 10,
    Unlink = 11,
    Rmdir = 12,
    SetXattr = 13,
    RemoveXattr = 14,
    Write = 15,
    Clone = 16,
    Truncate = 17,
    Chmod = 18,
    Chown = 19,
    Utimes = 20,
    End = 21,
    UpdateExtent = 22,
}

impl Command {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Subvol),
            2 => Some(Self::Snapshot),
            3 => Some(Self::Mkfile),
            4 => Some(Self::Mkdir),
            5 => Some(Self::Mknod),
            6 => Some(Self::Mkfifo),
            7 => Some(Self::Mksock),
            8 => Some(Self::Symlink),
            9 => Some(Self::Rename),
            10 => Some(Self::Link),
            11 => Some(Self::Unlink),
            12 => Some(Self::Rmdir),
            13 => Some(Self::SetXattr),
            14 => Some(Self::RemoveXattr),
            15 => Some(Self::Write),
            16 => Some(Self::Clone),
            17 => Some(Self::Truncate),
            18 => Some(Self::Chmod),
            19 => Some(Self::Chown),
            20 => Some(Self::Utimes),
            21 => Some(Self::End),
            22 => Some(Self::UpdateExtent),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Subvol => "subvol",
            Self::Snapshot => "snapshot",
            Self::Mkfile => "mkfile",
            Self::Mkdir => "mkdir",
            Self::Mknod => "mknod",
            Self::Mkfifo => "mkfifo",
            Self::Mksock => "mksock",
            Self::Symlink => "symlink",
            Self::Rename => "rename",
            Self::Link => "link",
            Self::Unlink => "unlink",
            Self::Rmdir => "rmdir",
            Self::SetXattr => "set_xattr",
            Self::RemoveXattr => "remove_xattr",
            Self::Write => "write",
            Self::Clone => "clone",
            Self::Truncate => "truncate",
            Self::Chmod => "chmod",
            Self::Chown => "chown",
            Self::Utimes => "utimes",
            Self::End => "end",
            Self::UpdateExtent => "update_extent",
        }
    }

    /// Commands that bring a new inode into existence.
    pub fn is_create(self) -> bool {
        matches!(
            self,
            Self::Mkfile | Self::Mkdir | Self::Mknod | Self::Mkfifo | Self::Mksock | Self::Symlink
        )
    }
}

// =============================================================================
// Attribute Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Attribute {
    Uuid = 1,
    Ctransid = 2,
    Ino = 3,
    Size = 4,
    Mode = 5,
    Uid = 6,
    Gid = 7,
    Rdev = 8,
    Ctime = 9,
    Mtime = 10,
    Atime = 11,
    Otime = 12,
    XattrName = 13,
    XattrData = 14,
    Path = 15,
    PathTo = 16,
    PathLink = 17,
    FileOffset = 18,
    Data = 19,
    CloneUuid = 20,
    CloneCtransid = 21,
    ClonePath = 22,
    CloneOffset = 23,
    CloneLen = 24,
}

impl Attribute {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Uuid),
            2 => Some(Self::Ctransid),
            3 => Some(Self::Ino),
            4 => Some(Self::Size),
            5 => Some(Self::Mode),
            6 => Some(Self::Uid),
            7 => Some(Self::Gid),
            8 => Some(Self::Rdev),
            9 => Some(Self::Ctime),
            10 => Some(Self::Mtime),
            11 => Some(Self::Atime),
            12 => Some(Self::Otime),
            13 => Some(Self::XattrName),
            14 => Some(Self::XattrData),
            15 => Some(Self::Path),
            16 => Some(Self::PathTo),
            17 => Some(Self::PathLink),
            18 => Some(Self::FileOffset),
            19 => Some(Self::Data),
            20 => Some(Self::CloneUuid),
            21 => Some(Self::CloneCtransid),
            22 => Some(Self::ClonePath),
            23 => Some(Self::CloneOffset),
            24 => Some(Self::CloneLen),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Ctransid => "ctransid",
            Self::Ino => "ino",
            Self::Size => "size",
            Self::Mode => "mode",
            Self::Uid => "uid",
            Self::Gid => "gid",
            Self::Rdev => "rdev",
            Self::Ctime => "ctime",
            Self::Mtime => "mtime",
            Self::Atime => "atime",
            Self::Otime => "otime",
            Self::XattrName => "xattr_name",
            Self::XattrData => "xattr_data",
            Self::Path => "path",
            Self::PathTo => "path_to",
            Self::PathLink => "path_link",
            Self::FileOffset => "file_offset",
            Self::Data => "data",
            Self::CloneUuid => "clone_uuid",
            Self::CloneCtransid => "clone_ctransid",
            Self::ClonePath => "clone_path",
            Self::CloneOffset => "clone_offset",
            Self::CloneLen => "clone_len",
        }
    }
}

// =============================================================================
// Checksums and device numbers
// =============================================================================

/// Raw CRC32C update: no pre- or post-inversion, as used for command checksums.
pub fn crc32c(seed: u32, data: &[u8]) -> u32 {
    !crc32c::crc32c_append(!seed, data)
}

/// Re-encode an on-disk device number in the userspace `makedev` layout.
pub fn encode_rdev(rdev: u64) -> u64 {
    let major = (rdev & 0xFFF_FFFF_FFFF) >> 20;
    let minor = rdev & 0xFFFFF;
    makedev(major, minor)
}

pub fn makedev(major: u64, minor: u64) -> u64 {
    ((major & 0xFFFF_F000) << 32)
        | ((major & 0xFFF) << 8)
        | ((minor & 0xFFFF_FF00) << 12)
        | (minor & 0xFF)
}

/// Inverse of [`makedev`].
pub fn split_dev(dev: u64) -> (u64, u64) {
    let major = ((dev >> 32) & 0xFFFF_F000) | ((dev >> 8) & 0xFFF);
    let minor = ((dev >> 12) & 0xFFFF_FF00) | (dev & 0xFF);
    (major, minor)
}
