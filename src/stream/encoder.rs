//! Command encoder.
//!
//! Commands are appended to a single `BytesMut`. A command header is reserved
//! by `begin_command`, attributes follow, and `finish_command` patches the body
//! length and checksum in place. The buffer is only handed out between
//! commands, so a reader never sees a partial record.

use crate::error::{Result, SendError};
use crate::stream::protocol::{
    crc32c, Attribute, Command, ATTRIBUTE_HEADER_SIZE, COMMAND_HEADER_SIZE, CRC_OFFSET,
    STREAM_MAGIC, STREAM_VERSION,
};
use crate::tree::items::{Times, Timespec};
use bytes::{BufMut, Bytes, BytesMut};

/// Position of an unfinished command in the buffer.
#[derive(Debug)]
#[must_use = "a begun command must be finished or abandoned"]
pub struct CommandMark {
    start: usize,
    cmd: Command,
}

pub struct CommandEncoder {
    buf: BytesMut,
    commands: u64,
    bytes: u64,
}

impl CommandEncoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            commands: 0,
            bytes: 0,
        }
    }

    pub fn write_stream_header(&mut self) {
        self.buf.put_slice(STREAM_MAGIC);
        self.buf.put_u32_le(STREAM_VERSION);
    }

    pub fn begin_command(&mut self, cmd: Command) -> CommandMark {
        let start = self.buf.len();
        self.buf.put_bytes(0, COMMAND_HEADER_SIZE);
        CommandMark { start, cmd }
    }

    pub fn add_attribute(&mut self, attr: Attribute, data: &[u8]) -> Result<()> {
        let len = u16::try_from(data.len())
            .map_err(|_| SendError::AttributeTooLarge { len: data.len() })?;
        self.buf.reserve(ATTRIBUTE_HEADER_SIZE + data.len());
        self.buf.put_u16_le(attr as u16);
        self.buf.put_u16_le(len);
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn add_u64(&mut self, attr: Attribute, value: u64) -> Result<()> {
        self.add_attribute(attr, &value.to_le_bytes())
    }

    pub fn add_timespec(&mut self, attr: Attribute, ts: Timespec) -> Result<()> {
        self.add_attribute(attr, &ts.to_bytes())
    }

    /// Patch length and checksum into the header reserved at `mark`.
    pub fn finish_command(&mut self, mark: CommandMark) {
        let body_len = (self.buf.len() - mark.start - COMMAND_HEADER_SIZE) as u32;
        let header = &mut self.buf[mark.start..mark.start + COMMAND_HEADER_SIZE];
        header[0..4].copy_from_slice(&body_len.to_le_bytes());
        header[4..6].copy_from_slice(&(mark.cmd as u16).to_le_bytes());
        header[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());

        let crc = crc32c(0, &self.buf[mark.start..]);
        self.buf[mark.start + CRC_OFFSET..mark.start + CRC_OFFSET + 4]
            .copy_from_slice(&crc.to_le_bytes());

        self.commands += 1;
        tracing::trace!(cmd = mark.cmd.name(), len = body_len, "command");
    }

    /// Drop everything written since `mark`.
    pub fn abandon(&mut self, mark: CommandMark) {
        self.buf.truncate(mark.start);
    }

    /// Encode a whole command. On error nothing is left in the buffer.
    pub fn command<F>(&mut self, cmd: Command, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let mark = self.begin_command(cmd);
        match f(self) {
            Ok(()) => {
                self.finish_command(mark);
                Ok(())
            }
            Err(e) => {
                self.abandon(mark);
                Err(e)
            }
        }
    }

    /// Bytes buffered and not yet taken.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Hand out all buffered bytes, keeping the allocation for reuse.
    pub fn take(&mut self) -> Bytes {
        self.bytes += self.buf.len() as u64;
        self.buf.split().freeze()
    }

    /// Number of finished commands.
    pub fn commands(&self) -> u64 {
        self.commands
    }

    /// Total bytes handed out through `take`.
    pub fn bytes_taken(&self) -> u64 {
        self.bytes
    }

    // =========================================================================
    // Typed commands
    // =========================================================================

    pub fn subvol(&mut self, name: &[u8], uuid: &[u8; 16], ctransid: u64) -> Result<()> {
        self.command(Command::Subvol, |e| {
            e.add_attribute(Attribute::Path, name)?;
            e.add_attribute(Attribute::Uuid, uuid)?;
            e.add_u64(Attribute::Ctransid, ctransid)
        })
    }

    /// mkfile, mkdir, mkfifo, mksock: placeholder path plus inode number.
    pub fn create(&mut self, cmd: Command, path: &[u8], ino: u64) -> Result<()> {
        self.command(cmd, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_u64(Attribute::Ino, ino)
        })
    }

    /// Device nodes, FIFOs and sockets carry a device number and full mode.
    pub fn mknod(&mut self, cmd: Command, path: &[u8], ino: u64, rdev: u64, mode: u64) -> Result<()> {
        self.command(cmd, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_u64(Attribute::Ino, ino)?;
            e.add_u64(Attribute::Rdev, rdev)?;
            e.add_u64(Attribute::Mode, mode)
        })
    }

    /// `target` is `None` for an empty symlink, which carries no link attribute.
    pub fn symlink(&mut self, path: &[u8], ino: u64, target: Option<&[u8]>) -> Result<()> {
        self.command(Command::Symlink, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_u64(Attribute::Ino, ino)?;
            match target {
                Some(target) => e.add_attribute(Attribute::PathLink, target),
                None => Ok(()),
            }
        })
    }

    pub fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<()> {
        self.command(Command::Rename, |e| {
            e.add_attribute(Attribute::Path, from)?;
            e.add_attribute(Attribute::PathTo, to)
        })
    }

    /// Create `path` as a new name for the inode already at `existing`.
    pub fn link(&mut self, path: &[u8], existing: &[u8]) -> Result<()> {
        self.command(Command::Link, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_attribute(Attribute::PathLink, existing)
        })
    }

    pub fn set_xattr(&mut self, path: &[u8], name: &[u8], value: &[u8]) -> Result<()> {
        self.command(Command::SetXattr, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_attribute(Attribute::XattrName, name)?;
            e.add_attribute(Attribute::XattrData, value)
        })
    }

    pub fn write(&mut self, path: &[u8], offset: u64, data: &[u8]) -> Result<()> {
        self.command(Command::Write, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_u64(Attribute::FileOffset, offset)?;
            e.add_attribute(Attribute::Data, data)
        })
    }

    pub fn truncate(&mut self, path: &[u8], size: u64) -> Result<()> {
        self.command(Command::Truncate, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_u64(Attribute::Size, size)
        })
    }

    pub fn chown(&mut self, path: &[u8], uid: u64, gid: u64) -> Result<()> {
        self.command(Command::Chown, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_u64(Attribute::Uid, uid)?;
            e.add_u64(Attribute::Gid, gid)
        })
    }

    /// Permission bits only; the file type is stripped.
    pub fn chmod(&mut self, path: &[u8], mode: u32) -> Result<()> {
        self.command(Command::Chmod, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_u64(Attribute::Mode, u64::from(mode & 0o7777))
        })
    }

    pub fn utimes(&mut self, path: &[u8], times: &Times) -> Result<()> {
        self.command(Command::Utimes, |e| {
            e.add_attribute(Attribute::Path, path)?;
            e.add_timespec(Attribute::Atime, times.atime)?;
            e.add_timespec(Attribute::Mtime, times.mtime)?;
            e.add_timespec(Attribute::Ctime, times.ctime)
        })
    }

    pub fn end(&mut self) -> Result<()> {
        self.command(Command::End, |_| Ok(()))
    }
}
