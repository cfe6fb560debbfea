//! Snapshot a local directory into a [`MemoryTree`].
//!
//! The walk does not cross filesystems or follow symlinks and includes hidden
//! files. Inode numbers are assigned from 257 upward in the order of the
//! source inode numbers, so a hardlinked file keeps one inode and the tree
//! has the same shape the source filesystem would give it. Every entry is
//! read once and held in memory.

use crate::error::{Result, SendError};
use crate::stream::protocol::{crc32c, split_dev};
use crate::tree::items::{InodeItem, Timespec};
use crate::tree::{MemoryTree, TreeBuilder, SUBVOL_ROOT_INODE};
use ignore::WalkBuilder;
use std::collections::{HashMap, HashSet};
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Subvolume name. Defaults to the directory's own name.
    pub name: Option<String>,

    /// Files up to this size are stored inline in their extent item
    pub max_inline: usize,

    /// Copy extended attributes
    pub xattrs: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            name: None,
            max_inline: 2048,
            xattrs: true,
        }
    }
}

/// What was read from an entry before its metadata is recorded.
enum Content {
    Directory,
    Symlink(Vec<u8>),
    File(Vec<u8>),
    Special,
}

fn imaged_ino(numbers: &HashMap<(u64, u64), u64>, path: &Path, meta: &Metadata) -> Result<u64> {
    numbers
        .get(&(meta.ino(), meta.dev()))
        .copied()
        .ok_or_else(|| SendError::Io(io::Error::other(format!("no inode for {}", path.display()))))
}

fn walk_error(e: ignore::Error) -> SendError {
    let message = e.to_string();
    e.into_io_error()
        .map(SendError::Io)
        .unwrap_or_else(|| SendError::Io(io::Error::other(message)))
}

/// Build a read-only subvolume tree holding a copy of `root`.
pub fn image_directory(root: &Path, options: &ImageOptions) -> Result<MemoryTree> {
    if !fs::symlink_metadata(root)?.is_dir() {
        return Err(SendError::InvalidSubvolume(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .follow_links(false)
        .same_file_system(true)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut entries: Vec<(PathBuf, Metadata)> = Vec::new();
    for result in walker {
        let entry = result.map_err(walk_error)?;
        if entry.depth() == 0 {
            continue;
        }
        let meta = fs::symlink_metadata(entry.path())?;
        entries.push((entry.into_path(), meta));
    }

    let mut sources: Vec<(u64, u64)> = entries.iter().map(|(_, m)| (m.ino(), m.dev())).collect();
    sources.sort_unstable();
    sources.dedup();
    let numbers: HashMap<(u64, u64), u64> = sources.into_iter().zip(SUBVOL_ROOT_INODE + 1..).collect();

    // Reading touches atimes, so contents are read before any times are recorded.
    let mut contents: HashMap<u64, Content> = HashMap::new();
    for (path, meta) in &entries {
        let ino = imaged_ino(&numbers, path, meta)?;
        if contents.contains_key(&ino) {
            continue;
        }
        let file_type = meta.file_type();
        let content = if file_type.is_dir() {
            Content::Directory
        } else if file_type.is_symlink() {
            Content::Symlink(fs::read_link(path)?.into_os_string().into_vec())
        } else if file_type.is_file() {
            Content::File(fs::read(path)?)
        } else {
            Content::Special
        };
        contents.insert(ino, content);
    }
    let root_meta = fs::symlink_metadata(root)?;

    let name = options
        .name
        .clone()
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "snapshot".to_string());
    let mut builder = TreeBuilder::new(name.clone()).max_inline(options.max_inline);
    builder.info_mut().uuid = name_uuid(&name);
    builder.inode(SUBVOL_ROOT_INODE, |inode| apply_metadata(inode, &root_meta));
    if options.xattrs {
        for (key, value) in read_xattrs(root) {
            builder.xattr(SUBVOL_ROOT_INODE, key, &value);
        }
    }

    let mut dirs: HashMap<PathBuf, u64> = HashMap::new();
    dirs.insert(root.to_path_buf(), SUBVOL_ROOT_INODE);
    let mut seen: HashSet<u64> = HashSet::new();

    for (path, meta) in &entries {
        let parent = path
            .parent()
            .and_then(|p| dirs.get(p))
            .copied()
            .ok_or_else(|| io::Error::other(format!("parent of {} not imaged", path.display())))?;
        let ino = imaged_ino(&numbers, path, meta)?;
        let entry_name = path.file_name().map(|n| n.as_bytes()).unwrap_or_default();

        if !seen.insert(ino) {
            builder.hardlink(ino, parent, entry_name);
            continue;
        }

        let meta = fs::symlink_metadata(path)?;
        match contents.get(&ino) {
            Some(Content::Directory) => {
                builder.dir(ino, parent, entry_name);
                dirs.insert(path.clone(), ino);
            }
            Some(Content::Symlink(target)) => {
                builder.symlink(ino, parent, entry_name, target);
            }
            Some(Content::File(data)) => {
                builder.file(ino, parent, entry_name, data);
            }
            Some(Content::Special) | None => {
                builder.special(ino, parent, entry_name, meta.mode(), disk_rdev(meta.rdev()));
            }
        }
        builder.inode(ino, |inode| apply_metadata(inode, &meta));

        if options.xattrs {
            for (key, value) in read_xattrs(path) {
                builder.xattr(ino, key, &value);
            }
        }
    }

    let tree = builder.build();
    info!(
        root = %root.display(),
        subvolume = %name,
        entries = entries.len(),
        items = tree.item_count(),
        "imaged directory"
    );
    Ok(tree)
}

fn timespec(sec: i64, nsec: i64) -> Timespec {
    Timespec::new(sec.max(0) as u64, nsec.clamp(0, 999_999_999) as u32)
}

/// Ownership, permissions and times. Sizes come from the content.
fn apply_metadata(inode: &mut InodeItem, meta: &Metadata) {
    inode.uid = meta.uid();
    inode.gid = meta.gid();
    inode.mode = meta.mode();
    inode.atime = timespec(meta.atime(), meta.atime_nsec());
    inode.mtime = timespec(meta.mtime(), meta.mtime_nsec());
    inode.ctime = timespec(meta.ctime(), meta.ctime_nsec());
    inode.otime = inode.ctime;
}

/// Userspace `st_rdev` to the on-disk (major << 20 | minor) layout.
fn disk_rdev(rdev: u64) -> u64 {
    let (major, minor) = split_dev(rdev);
    (major << 20) | (minor & 0xFFFFF)
}

/// Stable per-name UUID, so repeated images of one directory match.
fn name_uuid(name: &str) -> [u8; 16] {
    let mut uuid = [0u8; 16];
    for (seed, chunk) in uuid.chunks_mut(4).enumerate() {
        chunk.copy_from_slice(&crc32c(seed as u32, name.as_bytes()).to_le_bytes());
    }
    uuid
}

/// Sorted name/value pairs. Filesystems without xattr support yield none.
fn read_xattrs(path: &Path) -> Vec<(Vec<u8>, Vec<u8>)> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) => {
            debug!(path = %path.display(), "cannot list xattrs: {}", e);
            return Vec::new();
        }
    };
    let mut pairs = Vec::new();
    for name in names {
        match xattr::get(path, &name) {
            Ok(Some(value)) => pairs.push((name.as_bytes().to_vec(), value)),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), name = ?name, "cannot read xattr: {}", e),
        }
    }
    pairs.sort();
    pairs
}
