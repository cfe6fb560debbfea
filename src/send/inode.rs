//! Inode materialization and finalization.

use crate::error::{Result, SendError};
use crate::send::registry::{synthesize_name, OrphanEntry};
use crate::send::traversal::{StreamSink, Traversal};
use crate::stream::protocol::{encode_rdev, Command};
use crate::tree::items::{
    inline_data, FileExtentHeader, FileKind, InodeItem, Times, EXTENT_TYPE_INLINE,
};
use crate::tree::{Item, Key, SubvolumeTree, TreeReader, EXTENT_DATA_KEY, SUBVOL_ROOT_INODE};
use bytes::Bytes;
use tracing::{debug, warn};

/// Metadata of the inode currently open in the traversal.
///
/// Its pending orphan entry, if any, is the orphan registry entry keyed by `ino`.
#[derive(Debug, Clone)]
pub(crate) struct InodeAccumulator {
    pub ino: u64,
    pub generation: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    pub times: Times,
    pub kind: FileKind,
    /// Created by mkfile, so finalization truncates to `size`.
    pub regular: bool,
    /// Current name in the output. Empty for the subvolume root.
    pub path: Bytes,
}

impl InodeAccumulator {
    fn new(ino: u64, inode: &InodeItem) -> Self {
        Self {
            ino,
            generation: inode.generation,
            uid: inode.uid,
            gid: inode.gid,
            mode: inode.mode,
            size: inode.size,
            times: inode.times(),
            kind: inode.kind(),
            regular: false,
            path: Bytes::new(),
        }
    }

    /// Symlinks carry 0777 by default and need no chmod.
    fn needs_chmod(&self) -> bool {
        !(self.kind == FileKind::Symlink && self.mode & 0o7777 == 0o777)
    }
}

impl<'t, T: SubvolumeTree, S: StreamSink> Traversal<'t, T, S> {
    pub(super) fn handle_inode(&mut self, reader: &T::Reader<'t>, item: &Item) -> Result<()> {
        let inode = InodeItem::parse(item)?;
        let ino = item.key.objectid;
        let mut acc = InodeAccumulator::new(ino, &inode);
        debug!(ino, mode = %format_args!("{:o}", inode.mode), size = inode.size, "inode");

        if ino == SUBVOL_ROOT_INODE {
            self.root_times = acc.times;
            self.current = Some(acc);
            return Ok(());
        }

        // Already created as the parent of an earlier inode.
        if acc.kind == FileKind::Directory {
            if let Some(orphan) = self.orphans.find(ino) {
                acc.path = orphan.placeholder.clone();
                self.current = Some(acc);
                return Ok(());
            }
        }

        let name = synthesize_name(ino, inode.generation);
        match acc.kind {
            FileKind::Socket => self.encoder.mknod(
                Command::Mksock,
                &name,
                ino,
                encode_rdev(inode.rdev),
                u64::from(inode.mode),
            )?,
            FileKind::Fifo => self.encoder.mknod(
                Command::Mkfifo,
                &name,
                ino,
                encode_rdev(inode.rdev),
                u64::from(inode.mode),
            )?,
            FileKind::Device => self.encoder.mknod(
                Command::Mknod,
                &name,
                ino,
                encode_rdev(inode.rdev),
                u64::from(inode.mode),
            )?,
            FileKind::Symlink => {
                let target = if inode.size > 0 {
                    Some(read_symlink_target(reader, ino)?)
                } else {
                    None
                };
                self.encoder.symlink(&name, ino, target.as_deref())?
            }
            FileKind::Directory => self.encoder.create(Command::Mkdir, &name, ino)?,
            FileKind::Regular => {
                self.encoder.create(Command::Mkfile, &name, ino)?;
                acc.regular = true;
            }
        }

        self.orphans.insert(OrphanEntry {
            inode: ino,
            is_dir: acc.kind == FileKind::Directory && inode.size > 0,
            placeholder: name.clone(),
        });
        self.stats.orphans_created += 1;
        acc.path = name;
        self.current = Some(acc);
        Ok(())
    }

    /// Emit the closing metadata commands for the open inode and clear it.
    pub(super) fn finalize_inode(&mut self) -> Result<()> {
        let Some(acc) = self.current.take() else {
            return Ok(());
        };

        if acc.regular {
            self.encoder.truncate(&acc.path, acc.size)?;
        }
        self.encoder
            .chown(&acc.path, u64::from(acc.uid), u64::from(acc.gid))?;
        if acc.needs_chmod() {
            self.encoder.chmod(&acc.path, acc.mode)?;
        }
        self.encoder.utimes(&acc.path, &acc.times)?;

        self.stats.inodes += 1;
        Ok(())
    }
}

/// Link target stored inline in the symlink's first extent item.
fn read_symlink_target<R: TreeReader>(reader: &R, ino: u64) -> Result<Bytes> {
    let key = Key::new(ino, EXTENT_DATA_KEY, 0);
    let item = reader
        .get_item(&key)?
        .ok_or(SendError::MissingItem { key })?;
    let header = FileExtentHeader::parse(&item)?;
    if header.extent_type != EXTENT_TYPE_INLINE {
        warn!(ino, "symlink data was not inline, sending an empty target");
        return Ok(Bytes::new());
    }
    inline_data(&item, &header)
}
