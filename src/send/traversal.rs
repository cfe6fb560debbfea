//! Traversal driver.
//!
//! One ascending pass over the subvolume tree. Items are grouped by inode;
//! when the objectid advances past the open inode, that inode is finalized
//! before the next item is dispatched. Whenever the output buffer passes the
//! high-water mark the driver suspends: it releases its reader, hands the
//! buffered commands to the sink, waits for them to be drained, then
//! re-acquires a reader and checks that the item it stopped at is unchanged.

use crate::config::SendConfig;
use crate::error::{Result, SendError};
use crate::send::inode::InodeAccumulator;
use crate::send::registry::{DirectoryRegistry, OrphanRegistry};
use crate::stream::encoder::CommandEncoder;
use crate::tree::items::Times;
use crate::tree::{
    Item, Key, SubvolumeTree, TreeReader, EXTENT_DATA_KEY, FS_TREE_OBJECTID, INODE_EXTREF_KEY,
    INODE_ITEM_KEY, INODE_REF_KEY, SUBVOL_ROOT_INODE, XATTR_ITEM_KEY,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info};

// =============================================================================
// Sink
// =============================================================================

/// Destination for finished commands.
pub trait StreamSink {
    /// Deliver a run of whole commands. Returns once the bytes have been
    /// consumed, or `Aborted` if the consumer went away.
    fn deliver(&mut self, data: Bytes) -> Result<()>;
}

impl StreamSink for Vec<u8> {
    fn deliver(&mut self, data: Bytes) -> Result<()> {
        self.extend_from_slice(&data);
        Ok(())
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for one send.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SendStats {
    /// Commands encoded, including subvol and end
    pub commands: u64,

    /// Stream bytes handed to the consumer, including the header
    pub bytes: u64,

    /// Inodes finalized
    pub inodes: u64,

    /// Placeholder names created
    pub orphans_created: u64,

    /// Write commands
    pub writes: u64,

    /// File content bytes carried by write commands
    pub data_bytes: u64,

    /// Times the producer waited for the consumer
    pub suspensions: u64,

    /// Compressed extents left out of the stream
    pub compressed_skipped: u64,
}

// =============================================================================
// Stream setup
// =============================================================================

/// Reject trees that cannot be sent.
pub fn check_sendable<T: SubvolumeTree>(tree: &T, config: &SendConfig) -> Result<()> {
    let info = tree.info();
    if info.root_id == FS_TREE_OBJECTID {
        return Err(SendError::InvalidSubvolume(
            "the top-level volume is not a subvolume".to_string(),
        ));
    }
    if !info.read_only && !config.allow_writable {
        return Err(SendError::InvalidSubvolume(format!(
            "subvolume {} is not read-only",
            info.name
        )));
    }
    let root = Key::new(SUBVOL_ROOT_INODE, INODE_ITEM_KEY, 0);
    if tree.reader()?.get_item(&root)?.is_none() {
        return Err(SendError::InvalidSubvolume(format!(
            "subvolume {} has no root directory",
            info.name
        )));
    }
    Ok(())
}

/// Encoder holding the stream header and the subvolume-begin command.
pub fn begin_stream<T: SubvolumeTree>(tree: &T, config: &SendConfig) -> Result<CommandEncoder> {
    let info = tree.info();
    let mut encoder = CommandEncoder::with_capacity(config.buffer_capacity()?);
    encoder.write_stream_header();
    encoder.subvol(info.name.as_bytes(), &info.stream_uuid(), info.ctransid)?;
    Ok(encoder)
}

/// Generate a whole stream into memory, without a consumer task.
pub fn send_to_vec<T: SubvolumeTree>(tree: &T, config: &SendConfig) -> Result<(Vec<u8>, SendStats)> {
    config.validate()?;
    check_sendable(tree, config)?;
    let encoder = begin_stream(tree, config)?;
    let mut out = Vec::new();
    let stats = Traversal::new(tree, config, encoder, &mut out).run()?;
    Ok((out, stats))
}

impl<S: StreamSink + ?Sized> StreamSink for &mut S {
    fn deliver(&mut self, data: Bytes) -> Result<()> {
        (**self).deliver(data)
    }
}

// =============================================================================
// Traversal
// =============================================================================

pub struct Traversal<'t, T: SubvolumeTree, S: StreamSink> {
    pub(super) tree: &'t T,
    pub(super) encoder: CommandEncoder,
    sink: S,
    high_water: usize,
    pub(super) max_write: usize,
    pub(super) orphans: OrphanRegistry,
    pub(super) dirs: DirectoryRegistry,
    /// The open inode, if any.
    pub(super) current: Option<InodeAccumulator>,
    pub(super) root_times: Times,
    pub(super) stats: SendStats,
}

impl<'t, T: SubvolumeTree, S: StreamSink> Traversal<'t, T, S> {
    pub fn new(tree: &'t T, config: &SendConfig, encoder: CommandEncoder, sink: S) -> Self {
        Self {
            tree,
            encoder,
            sink,
            high_water: config.high_water,
            max_write: config.max_write,
            orphans: OrphanRegistry::new(),
            dirs: DirectoryRegistry::new(),
            current: None,
            root_times: Times::default(),
            stats: SendStats::default(),
        }
    }

    /// Walk the whole tree, then emit the end command and flush.
    pub fn run(mut self) -> Result<SendStats> {
        let name = self.tree.info().name.clone();
        match self.walk() {
            Ok(()) => {
                self.stats.commands = self.encoder.commands();
                self.stats.bytes = self.encoder.bytes_taken();
                info!(
                    subvolume = %name,
                    commands = self.stats.commands,
                    bytes = self.stats.bytes,
                    inodes = self.stats.inodes,
                    "send complete"
                );
                Ok(self.stats)
            }
            Err(e) => {
                error!(subvolume = %name, class = ?e.class(), "send failed: {}", e);
                Err(e)
            }
        }
    }

    fn walk(&mut self) -> Result<()> {
        let mut reader = self.tree.reader()?;
        let mut cursor = reader.find_item(&Key::default())?;

        while let Some(item) = cursor {
            if self.over_high_water() {
                reader = self.suspend(reader, &item)?;
            }

            let advanced = matches!(&self.current, Some(acc) if item.key.objectid > acc.ino);
            if advanced {
                self.finalize_inode()?;
            }

            reader = self.dispatch(reader, &item)?;
            cursor = reader.next_item(&item.key)?;
        }
        drop(reader);

        self.finalize_inode()?;
        self.encoder.end()?;
        let rest = self.encoder.take();
        self.sink.deliver(rest)
    }

    fn dispatch(&mut self, reader: T::Reader<'t>, item: &Item) -> Result<T::Reader<'t>> {
        match item.key.item_type {
            INODE_ITEM_KEY => self.handle_inode(&reader, item)?,
            INODE_REF_KEY => self.handle_inode_ref(item)?,
            INODE_EXTREF_KEY => self.handle_inode_extref(item)?,
            EXTENT_DATA_KEY => return self.handle_extent(reader, item),
            XATTR_ITEM_KEY => self.handle_xattr(item)?,
            _ => {}
        }
        Ok(reader)
    }

    pub(super) fn over_high_water(&self) -> bool {
        self.encoder.len() > self.high_water
    }

    /// Release the tree, wait for the consumer, then resume at `item`.
    pub(super) fn suspend(&mut self, reader: T::Reader<'t>, item: &Item) -> Result<T::Reader<'t>> {
        drop(reader);
        let data = self.encoder.take();
        debug!(key = %item.key, bytes = data.len(), "suspending");
        self.sink.deliver(data)?;
        self.stats.suspensions += 1;

        let reader = self.tree.reader()?;
        let found = reader.find_item(&item.key)?;
        match found {
            None => Err(SendError::MissingItem { key: item.key }),
            Some(found) if found.key != item.key || found.data != item.data => {
                Err(SendError::SubvolumeChanged { key: item.key })
            }
            Some(_) => Ok(reader),
        }
    }

    /// The open inode, which must be the owner of `key`.
    pub(super) fn current_for(&self, key: &Key) -> Result<&InodeAccumulator> {
        match &self.current {
            Some(acc) if acc.ino == key.objectid => Ok(acc),
            _ => Err(SendError::NoInodeItem { key: *key }),
        }
    }

    pub(super) fn current_for_mut(&mut self, key: &Key) -> Result<&mut InodeAccumulator> {
        match &mut self.current {
            Some(acc) if acc.ino == key.objectid => Ok(acc),
            _ => Err(SendError::NoInodeItem { key: *key }),
        }
    }
}
