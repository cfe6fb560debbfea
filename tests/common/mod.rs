//! Shared helpers for integration tests: a minimal receiver that replays a
//! decoded stream into an in-memory namespace, and the namespace a tree
//! should produce.

#![allow(dead_code)]

use sendstream::stream::{decode_stream, Attribute, Command, DecodedCommand};
use sendstream::stream::protocol::encode_rdev;
use sendstream::tree::items::{
    inline_data, parse_inode_extrefs, parse_inode_refs, parse_xattrs, FileExtentHeader, FileKind,
    InodeItem, RegularExtent, Timespec, EXTENT_TYPE_INLINE, EXTENT_TYPE_REGULAR,
};
use sendstream::tree::{
    Key, MemoryTree, SubvolumeTree, TreeReader, EXTENT_DATA_KEY, INODE_EXTREF_KEY, INODE_ITEM_KEY,
    INODE_REF_KEY, SUBVOL_ROOT_INODE, XATTR_ITEM_KEY,
};
use sendstream::{send_to_vec, SendConfig};
use std::collections::{BTreeMap, HashMap, HashSet};

/// What a receiver can observe about one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ino: u64,
    pub kind: FileKind,
    /// Permission bits only
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    /// File content, or the symlink target
    pub content: Vec<u8>,
    pub xattrs: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Node {
    fn new(ino: u64, kind: FileKind) -> Self {
        Self {
            ino,
            kind,
            mode: if kind == FileKind::Symlink { 0o777 } else { 0 },
            uid: 0,
            gid: 0,
            rdev: 0,
            atime: Timespec::default(),
            mtime: Timespec::default(),
            ctime: Timespec::default(),
            content: Vec::new(),
            xattrs: BTreeMap::new(),
        }
    }
}

/// Path (relative, no leading slash; the root is empty) to node.
pub type Namespace = BTreeMap<Vec<u8>, Node>;

pub fn join(parent: &[u8], name: &[u8]) -> Vec<u8> {
    if parent.is_empty() {
        return name.to_vec();
    }
    let mut path = parent.to_vec();
    path.push(b'/');
    path.extend_from_slice(name);
    path
}

fn parent_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[..i],
        None => b"",
    }
}

fn show(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

// =============================================================================
// Replay
// =============================================================================

#[derive(Debug)]
pub struct Replay {
    paths: BTreeMap<Vec<u8>, u64>,
    nodes: HashMap<u64, Node>,
    created: HashSet<u64>,
    ended: bool,
}

impl Default for Replay {
    fn default() -> Self {
        let mut paths = BTreeMap::new();
        paths.insert(Vec::new(), SUBVOL_ROOT_INODE);
        let mut nodes = HashMap::new();
        nodes.insert(
            SUBVOL_ROOT_INODE,
            Node::new(SUBVOL_ROOT_INODE, FileKind::Directory),
        );
        Self {
            paths,
            nodes,
            created: HashSet::new(),
            ended: false,
        }
    }
}

impl Replay {
    fn node_mut(&mut self, path: &[u8]) -> Result<&mut Node, String> {
        let ino = *self
            .paths
            .get(path)
            .ok_or_else(|| format!("no such path {:?}", show(path)))?;
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| format!("dangling inode {}", ino))
    }

    fn check_new_name(&self, path: &[u8]) -> Result<(), String> {
        if self.paths.contains_key(path) {
            return Err(format!("{:?} already exists", show(path)));
        }
        let parent = parent_of(path);
        match self.paths.get(parent).and_then(|ino| self.nodes.get(ino)) {
            Some(node) if node.kind == FileKind::Directory => Ok(()),
            _ => Err(format!("parent of {:?} is not a directory", show(path))),
        }
    }

    fn path(c: &DecodedCommand, attr: Attribute) -> Result<Vec<u8>, String> {
        c.get(attr)
            .map(|b| b.to_vec())
            .ok_or_else(|| format!("{} without {}", c.cmd.name(), attr.name()))
    }

    fn u64(c: &DecodedCommand, attr: Attribute) -> Result<u64, String> {
        c.get_u64(attr)
            .ok_or_else(|| format!("{} without {}", c.cmd.name(), attr.name()))
    }

    pub fn apply(&mut self, c: &DecodedCommand) -> Result<(), String> {
        if self.ended {
            return Err(format!("{} after end", c.cmd.name()));
        }
        match c.cmd {
            Command::Subvol => {}
            Command::Mkfile
            | Command::Mkdir
            | Command::Mknod
            | Command::Mkfifo
            | Command::Mksock
            | Command::Symlink => {
                let path = Self::path(c, Attribute::Path)?;
                let ino = Self::u64(c, Attribute::Ino)?;
                if !self.created.insert(ino) {
                    return Err(format!("inode {} created twice", ino));
                }
                self.check_new_name(&path)?;
                let kind = match c.cmd {
                    Command::Mkfile => FileKind::Regular,
                    Command::Mkdir => FileKind::Directory,
                    Command::Mkfifo => FileKind::Fifo,
                    Command::Mksock => FileKind::Socket,
                    Command::Symlink => FileKind::Symlink,
                    _ => FileKind::Device,
                };
                let mut node = Node::new(ino, kind);
                if let Some(mode) = c.get_u64(Attribute::Mode) {
                    node.mode = (mode as u32) & 0o7777;
                }
                if let Some(rdev) = c.get_u64(Attribute::Rdev) {
                    node.rdev = rdev;
                }
                if let Some(target) = c.get(Attribute::PathLink) {
                    node.content = target.to_vec();
                }
                self.nodes.insert(ino, node);
                self.paths.insert(path, ino);
            }
            Command::Rename => {
                let from = Self::path(c, Attribute::Path)?;
                let to = Self::path(c, Attribute::PathTo)?;
                if !self.paths.contains_key(&from) {
                    return Err(format!("rename of missing {:?}", show(&from)));
                }
                self.check_new_name(&to)?;
                let mut prefix = from.clone();
                prefix.push(b'/');
                let moved: Vec<Vec<u8>> = self
                    .paths
                    .keys()
                    .filter(|p| **p == from || p.starts_with(&prefix))
                    .cloned()
                    .collect();
                for old in moved {
                    if let Some(ino) = self.paths.remove(&old) {
                        let mut new = to.clone();
                        new.extend_from_slice(&old[from.len()..]);
                        self.paths.insert(new, ino);
                    }
                }
            }
            Command::Link => {
                let path = Self::path(c, Attribute::Path)?;
                let existing = Self::path(c, Attribute::PathLink)?;
                let ino = *self
                    .paths
                    .get(&existing)
                    .ok_or_else(|| format!("link to missing {:?}", show(&existing)))?;
                if self.nodes.get(&ino).map(|n| n.kind) == Some(FileKind::Directory) {
                    return Err(format!("link to directory {:?}", show(&existing)));
                }
                self.check_new_name(&path)?;
                self.paths.insert(path, ino);
            }
            Command::SetXattr => {
                let path = Self::path(c, Attribute::Path)?;
                let name = Self::path(c, Attribute::XattrName)?;
                let value = Self::path(c, Attribute::XattrData)?;
                self.node_mut(&path)?.xattrs.insert(name, value);
            }
            Command::Write => {
                let path = Self::path(c, Attribute::Path)?;
                let offset = Self::u64(c, Attribute::FileOffset)? as usize;
                let data = Self::path(c, Attribute::Data)?;
                let node = self.node_mut(&path)?;
                if node.kind != FileKind::Regular {
                    return Err(format!("write to non-file {:?}", show(&path)));
                }
                let end = offset + data.len();
                if node.content.len() < end {
                    node.content.resize(end, 0);
                }
                node.content[offset..end].copy_from_slice(&data);
            }
            Command::Truncate => {
                let path = Self::path(c, Attribute::Path)?;
                let size = Self::u64(c, Attribute::Size)? as usize;
                self.node_mut(&path)?.content.resize(size, 0);
            }
            Command::Chown => {
                let path = Self::path(c, Attribute::Path)?;
                let uid = Self::u64(c, Attribute::Uid)?;
                let gid = Self::u64(c, Attribute::Gid)?;
                let node = self.node_mut(&path)?;
                node.uid = uid;
                node.gid = gid;
            }
            Command::Chmod => {
                let path = Self::path(c, Attribute::Path)?;
                let mode = Self::u64(c, Attribute::Mode)? as u32;
                self.node_mut(&path)?.mode = mode & 0o7777;
            }
            Command::Utimes => {
                let path = Self::path(c, Attribute::Path)?;
                let get = |attr| {
                    c.get_timespec(attr)
                        .ok_or_else(|| format!("utimes without {}", attr.name()))
                };
                let (atime, mtime, ctime) =
                    (get(Attribute::Atime)?, get(Attribute::Mtime)?, get(Attribute::Ctime)?);
                let node = self.node_mut(&path)?;
                node.atime = atime;
                node.mtime = mtime;
                node.ctime = ctime;
            }
            Command::End => self.ended = true,
            other => return Err(format!("unexpected command {}", other.name())),
        }
        Ok(())
    }

    pub fn namespace(&self) -> Namespace {
        self.paths
            .iter()
            .filter_map(|(path, ino)| Some((path.clone(), self.nodes.get(ino)?.clone())))
            .collect()
    }
}

/// Replay a whole stream. Fails on the first command a receiver would reject.
pub fn replay(commands: &[DecodedCommand]) -> Result<Namespace, String> {
    let mut replay = Replay::default();
    for (i, c) in commands.iter().enumerate() {
        replay
            .apply(c)
            .map_err(|e| format!("command {} ({}): {}", i, c.cmd.name(), e))?;
    }
    if !replay.ended {
        return Err("stream has no end command".to_string());
    }
    Ok(replay.namespace())
}

// =============================================================================
// Expected namespace
// =============================================================================

fn all_items(tree: &MemoryTree) -> Vec<sendstream::Item> {
    let reader = tree.reader().unwrap();
    let mut items = Vec::new();
    let mut cursor = reader.find_item(&Key::default()).unwrap();
    while let Some(item) = cursor {
        cursor = reader.next_item(&item.key).unwrap();
        items.push(item);
    }
    items
}

fn place(content: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if content.len() < end {
        content.resize(end, 0);
    }
    content[offset..end].copy_from_slice(data);
}

/// The namespace a correct receiver ends up with for `tree`.
pub fn expected(tree: &MemoryTree) -> Namespace {
    let reader = tree.reader().unwrap();
    let mut inodes: BTreeMap<u64, InodeItem> = BTreeMap::new();
    let mut links: Vec<(u64, u64, Vec<u8>)> = Vec::new();
    let mut contents: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut xattrs: HashMap<u64, BTreeMap<Vec<u8>, Vec<u8>>> = HashMap::new();

    for item in all_items(tree) {
        let ino = item.key.objectid;
        match item.key.item_type {
            INODE_ITEM_KEY => {
                inodes.insert(ino, InodeItem::parse(&item).unwrap());
            }
            INODE_REF_KEY if item.key.offset != ino => {
                for r in parse_inode_refs(&item).unwrap() {
                    links.push((ino, r.parent, r.name.to_vec()));
                }
            }
            INODE_EXTREF_KEY => {
                for r in parse_inode_extrefs(&item).unwrap() {
                    links.push((ino, r.parent, r.name.to_vec()));
                }
            }
            XATTR_ITEM_KEY => {
                for e in parse_xattrs(&item).unwrap() {
                    xattrs
                        .entry(ino)
                        .or_default()
                        .insert(e.name.to_vec(), e.value.to_vec());
                }
            }
            EXTENT_DATA_KEY => {
                let header = FileExtentHeader::parse(&item).unwrap();
                let data = match header.extent_type {
                    EXTENT_TYPE_INLINE => inline_data(&item, &header).unwrap().to_vec(),
                    EXTENT_TYPE_REGULAR => {
                        let extent = RegularExtent::parse(&item).unwrap();
                        if extent.is_hole() {
                            continue;
                        }
                        reader
                            .read_extent(
                                extent.disk_bytenr + extent.offset,
                                extent.num_bytes as usize,
                            )
                            .unwrap()
                            .to_vec()
                    }
                    _ => continue,
                };
                place(
                    contents.entry(ino).or_default(),
                    item.key.offset as usize,
                    &data,
                );
            }
            _ => {}
        }
    }

    let dir_names: HashMap<u64, (u64, Vec<u8>)> = links
        .iter()
        .filter(|(ino, _, _)| {
            inodes.get(ino).map(|i| i.kind()) == Some(FileKind::Directory)
        })
        .map(|(ino, parent, name)| (*ino, (*parent, name.clone())))
        .collect();
    let dir_path = |mut ino: u64| -> Vec<u8> {
        let mut parts = Vec::new();
        while ino != SUBVOL_ROOT_INODE {
            let (parent, name) = &dir_names[&ino];
            parts.push(name.clone());
            ino = *parent;
        }
        parts
            .iter()
            .rev()
            .fold(Vec::new(), |path, name| join(&path, name))
    };

    let node = |ino: u64| -> Node {
        let inode = &inodes[&ino];
        let kind = inode.kind();
        let mut node = Node::new(ino, kind);
        node.mode = inode.mode & 0o7777;
        node.uid = u64::from(inode.uid);
        node.gid = u64::from(inode.gid);
        node.atime = inode.atime;
        node.mtime = inode.mtime;
        node.ctime = inode.ctime;
        node.xattrs = xattrs.get(&ino).cloned().unwrap_or_default();
        match kind {
            FileKind::Regular => {
                let mut content = contents.get(&ino).cloned().unwrap_or_default();
                content.resize(inode.size as usize, 0);
                node.content = content;
            }
            FileKind::Symlink => node.content = contents.get(&ino).cloned().unwrap_or_default(),
            FileKind::Device | FileKind::Fifo | FileKind::Socket => {
                node.rdev = encode_rdev(inode.rdev);
            }
            FileKind::Directory => {}
        }
        node
    };

    let mut namespace = Namespace::new();
    namespace.insert(Vec::new(), node(SUBVOL_ROOT_INODE));
    for (ino, parent, name) in &links {
        namespace.insert(join(&dir_path(*parent), name), node(*ino));
    }
    namespace
}

/// Send `tree` with `config`, decode the stream and replay it.
pub fn send_and_replay(
    tree: &MemoryTree,
    config: &SendConfig,
) -> (Vec<DecodedCommand>, Result<Namespace, String>) {
    let (out, _) = send_to_vec(tree, config).unwrap();
    let commands = decode_stream(&out).unwrap();
    let namespace = replay(&commands);
    (commands, namespace)
}

/// Render the differences between two namespaces, for assertion messages.
pub fn diff(expected: &Namespace, actual: &Namespace) -> String {
    let mut out = String::new();
    for (path, node) in expected {
        match actual.get(path) {
            None => out.push_str(&format!("missing {:?}\n", show(path))),
            Some(other) if other != node => out.push_str(&format!(
                "differs {:?}:\n  expected {:?}\n  actual   {:?}\n",
                show(path),
                node,
                other
            )),
            Some(_) => {}
        }
    }
    for path in actual.keys().filter(|p| !expected.contains_key(*p)) {
        out.push_str(&format!("unexpected {:?}\n", show(path)));
    }
    out
}

/// Assert that replaying the stream of `tree` reproduces it.
pub fn assert_round_trip(tree: &MemoryTree, config: &SendConfig) -> Vec<DecodedCommand> {
    let (commands, replayed) = send_and_replay(tree, config);
    let actual = replayed.unwrap_or_else(|e| panic!("replay failed: {}", e));
    let wanted = expected(tree);
    assert!(actual == wanted, "{}", diff(&wanted, &actual));
    commands
}
