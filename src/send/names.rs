//! Name resolution for inode references.
//!
//! Every (parent, name) pair gives the open inode a real name. The first name
//! of an orphan renames it away from its placeholder; later names become
//! hardlinks. A parent that has not been reached yet is created on the spot
//! under its own placeholder and named later, when its own items arrive.

use crate::error::Result;
use crate::send::registry::{join_path, synthesize_name, OrphanEntry};
use crate::send::traversal::{StreamSink, Traversal};
use crate::stream::protocol::Command;
use crate::tree::items::{parse_inode_extrefs, parse_inode_refs, NameRef, Times};
use crate::tree::{Item, SubvolumeTree, SUBVOL_ROOT_INODE};
use bytes::Bytes;
use tracing::debug;

/// Where a parent directory currently lives in the output.
enum ParentPath {
    Root,
    Directory { path: Bytes, times: Times },
    Orphan { placeholder: Bytes },
}

impl ParentPath {
    fn child(&self, name: &[u8]) -> Bytes {
        match self {
            ParentPath::Root => Bytes::copy_from_slice(name),
            ParentPath::Directory { path, .. } => join_path(path, name),
            ParentPath::Orphan { placeholder } => join_path(placeholder, name),
        }
    }
}

impl<'t, T: SubvolumeTree, S: StreamSink> Traversal<'t, T, S> {
    pub(super) fn handle_inode_ref(&mut self, item: &Item) -> Result<()> {
        // The root directory refers to itself.
        if item.key.objectid == item.key.offset {
            return Ok(());
        }
        let refs = parse_inode_refs(item)?;
        self.resolve_names(item, refs)
    }

    pub(super) fn handle_inode_extref(&mut self, item: &Item) -> Result<()> {
        let refs = parse_inode_extrefs(item)?;
        self.resolve_names(item, refs)
    }

    fn resolve_names(&mut self, item: &Item, refs: Vec<NameRef>) -> Result<()> {
        self.current_for(&item.key)?;
        let child = item.key.objectid;

        for r in refs {
            if r.parent == child {
                continue;
            }
            let parent = self.resolve_parent(r.parent, child)?;
            let path = parent.child(&r.name);
            self.found_path(item, path)?;
            self.touch_parent(&parent)?;
        }
        Ok(())
    }

    /// Find the parent's output path, creating it as an orphan directory if
    /// it has not been seen yet.
    fn resolve_parent(&mut self, parent: u64, child: u64) -> Result<ParentPath> {
        if parent == SUBVOL_ROOT_INODE {
            return Ok(ParentPath::Root);
        }
        if let Some(dir) = self.dirs.find(parent) {
            return Ok(ParentPath::Directory {
                path: dir.path.clone(),
                times: dir.times,
            });
        }
        if let Some(orphan) = self.orphans.find(parent) {
            return Ok(ParentPath::Orphan {
                placeholder: orphan.placeholder.clone(),
            });
        }

        let generation = match &self.current {
            Some(acc) if acc.ino == child => acc.generation,
            _ => 0,
        };
        let placeholder = synthesize_name(parent, generation);
        debug!(parent, child, "creating parent directory ahead of its inode");
        self.encoder.create(Command::Mkdir, &placeholder, parent)?;
        self.orphans.insert(OrphanEntry {
            inode: parent,
            is_dir: true,
            placeholder: placeholder.clone(),
        });
        self.stats.orphans_created += 1;
        Ok(ParentPath::Orphan { placeholder })
    }

    /// Give the open inode the name `path`.
    fn found_path(&mut self, item: &Item, path: Bytes) -> Result<()> {
        let acc = self.current_for(&item.key)?;
        let (ino, times, old_path) = (acc.ino, acc.times, acc.path.clone());

        match self.orphans.remove(ino) {
            Some(orphan) => {
                self.encoder.rename(&orphan.placeholder, &path)?;
                let moved = self.dirs.rebase(&orphan.placeholder, &path);
                if moved > 0 {
                    debug!(ino, moved, "rebased directory paths");
                }
                if orphan.is_dir {
                    self.dirs.insert(ino, path.clone(), times);
                }
                self.current_for_mut(&item.key)?.path = path;
            }
            None => {
                self.encoder.link(&path, &old_path)?;
            }
        }
        Ok(())
    }

    /// A new entry changes the parent's times; restore them.
    fn touch_parent(&mut self, parent: &ParentPath) -> Result<()> {
        match parent {
            ParentPath::Root => {
                let times = self.root_times;
                self.encoder.utimes(b"", &times)
            }
            ParentPath::Directory { path, times } => self.encoder.utimes(path, times),
            ParentPath::Orphan { .. } => Ok(()),
        }
    }
}
