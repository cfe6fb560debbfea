//! End-to-end send scenarios, checked by decoding and replaying the stream.

mod common;

use bytes::{Buf, Bytes};
use common::{assert_round_trip, replay};
use sendstream::send::{begin_stream, StreamSink, Traversal};
use sendstream::stream::protocol::{crc32c, COMMAND_HEADER_SIZE, CRC_OFFSET, STREAM_HEADER_SIZE};
use sendstream::stream::{decode_stream, Attribute, Command, DecodedCommand};
use sendstream::tree::items::{S_IFCHR, S_IFIFO, S_IFREG};
use sendstream::tree::{Key, MemoryTree, TreeBuilder, EXTENT_DATA_KEY};
use sendstream::{send_to_vec, SendConfig, SendError, SendSession};
use std::collections::HashMap;
use std::sync::Arc;

fn attr(c: &DecodedCommand, a: Attribute) -> Vec<u8> {
    c.get(a).map(|b| b.to_vec()).unwrap_or_default()
}

/// (command, path, second path) for compact sequence assertions.
fn outline(commands: &[DecodedCommand]) -> Vec<(Command, String, String)> {
    commands
        .iter()
        .map(|c| {
            let second = c
                .get(Attribute::PathTo)
                .or_else(|| c.get(Attribute::PathLink))
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            let path = c
                .path()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            (c.cmd, path, second)
        })
        .collect()
}

fn small_buffers() -> SendConfig {
    SendConfig {
        high_water: 4096,
        max_write: 4096,
        ..SendConfig::default()
    }
}

/// Records every buffer the traversal hands over.
#[derive(Default)]
struct RecordingSink {
    chunks: Vec<Bytes>,
}

impl StreamSink for RecordingSink {
    fn deliver(&mut self, data: Bytes) -> sendstream::Result<()> {
        self.chunks.push(data);
        Ok(())
    }
}

#[test]
fn test_single_file() {
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 256, "a", b"0123456789");
    let tree = builder.build();
    let commands = assert_round_trip(&tree, &SendConfig::default());

    let file: Vec<Command> = outline(&commands)
        .into_iter()
        .filter(|(_, path, second)| path == "a" || path == "o257-1-0" || second == "a")
        .map(|(cmd, _, _)| cmd)
        .collect();
    assert_eq!(
        file,
        vec![
            Command::Mkfile,
            Command::Rename,
            Command::Write,
            Command::Truncate,
            Command::Chown,
            Command::Chmod,
            Command::Utimes,
        ]
    );
    assert_eq!(commands.first().map(|c| c.cmd), Some(Command::Subvol));
    assert_eq!(commands.last().map(|c| c.cmd), Some(Command::End));

    let write = commands.iter().find(|c| c.cmd == Command::Write).unwrap();
    assert_eq!(write.get_u64(Attribute::FileOffset), Some(0));
    assert_eq!(attr(write, Attribute::Data), b"0123456789");
    let chmod = commands
        .iter()
        .find(|c| c.cmd == Command::Chmod && c.path() == Some(&b"a"[..]))
        .unwrap();
    assert_eq!(chmod.get_u64(Attribute::Mode), Some(0o644));
}

#[test]
fn test_parent_with_higher_inode_is_created_early() {
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 300, "f", b"hello").dir(300, 256, "d");
    let tree = builder.build();
    let commands = assert_round_trip(&tree, &SendConfig::default());

    let names: Vec<(Command, String, String)> = outline(&commands)
        .into_iter()
        .filter(|(cmd, _, _)| cmd.is_create() || *cmd == Command::Rename)
        .collect();
    let s = |v: &str| v.to_string();
    assert_eq!(
        names,
        vec![
            (Command::Mkfile, s("o257-1-0"), s("")),
            (Command::Mkdir, s("o300-1-0"), s("")),
            (Command::Rename, s("o257-1-0"), s("o300-1-0/f")),
            (Command::Rename, s("o300-1-0"), s("d")),
        ]
    );
    // The file's content is written while its parent still has a placeholder.
    let write = commands.iter().find(|c| c.cmd == Command::Write).unwrap();
    assert_eq!(write.path(), Some(&b"o300-1-0/f"[..]));
}

#[test]
fn test_hardlinks_share_one_inode() {
    let mut builder = TreeBuilder::new("snap");
    builder
        .file(257, 256, "x", b"shared")
        .hardlink(257, 256, "y");
    let tree = builder.build();
    let commands = assert_round_trip(&tree, &SendConfig::default());

    let count = |cmd| commands.iter().filter(|c| c.cmd == cmd).count();
    assert_eq!(count(Command::Mkfile), 1);
    assert_eq!(count(Command::Rename), 1);
    assert_eq!(count(Command::Link), 1);
    assert_eq!(count(Command::Write), 1);

    let link = commands.iter().find(|c| c.cmd == Command::Link).unwrap();
    assert_eq!(attr(link, Attribute::Path), b"y");
    assert_eq!(attr(link, Attribute::PathLink), b"x");
}

#[test]
fn test_suspension_mid_extent_keeps_offsets() {
    let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 256, "big", &data);
    let tree = builder.build();
    let config = small_buffers();

    let encoder = begin_stream(&tree, &config).unwrap();
    let mut sink = RecordingSink::default();
    let stats = Traversal::new(&tree, &config, encoder, &mut sink)
        .run()
        .unwrap();
    assert!(stats.suspensions >= 10);
    assert_eq!(sink.chunks.len() as u64, stats.suspensions + 1);

    // Every buffer holds whole commands.
    let header = &sink.chunks[0][..STREAM_HEADER_SIZE];
    for chunk in &sink.chunks[1..] {
        let mut framed = header.to_vec();
        framed.extend_from_slice(chunk);
        decode_stream(&framed).unwrap();
    }

    let stream: Vec<u8> = sink.chunks.iter().flat_map(|c| c.to_vec()).collect();
    let commands = decode_stream(&stream).unwrap();
    let offsets: Vec<u64> = commands
        .iter()
        .filter(|c| c.cmd == Command::Write)
        .map(|c| c.get_u64(Attribute::FileOffset).unwrap())
        .collect();
    let expected: Vec<u64> = (0..16).map(|i| i * 4096).collect();
    assert_eq!(offsets, expected);
    assert_eq!(stats.data_bytes, data.len() as u64);
    assert_round_trip(&tree, &config);
}

#[test]
fn test_every_checksum_matches() {
    let mut builder = TreeBuilder::new("snap");
    builder
        .dir(257, 256, "etc")
        .file(258, 257, "passwd", b"root:x:0:0")
        .symlink(259, 256, "lnk", "etc/passwd")
        .xattr(258, "user.tag", b"v");
    let tree = builder.build();
    let (out, stats) = send_to_vec(&tree, &SendConfig::default()).unwrap();

    let mut pos = STREAM_HEADER_SIZE;
    let mut seen = 0;
    while pos < out.len() {
        let len = (&out[pos..pos + 4]).get_u32_le() as usize;
        let end = pos + COMMAND_HEADER_SIZE + len;
        let stored = (&out[pos + CRC_OFFSET..pos + CRC_OFFSET + 4]).get_u32_le();
        let mut record = out[pos..end].to_vec();
        record[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        assert_eq!(stored, crc32c(0, &record), "command {} at {}", seen, pos);
        pos = end;
        seen += 1;
    }
    assert_eq!(pos, out.len());
    assert_eq!(seen, stats.commands);
}

#[test]
fn test_corrupted_stream_is_rejected() {
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 256, "a", b"abc");
    let (mut out, _) = send_to_vec(&builder.build(), &SendConfig::default()).unwrap();
    let last = out.len() - 1;
    out[last - 20] ^= 0xFF;
    assert!(matches!(
        decode_stream(&out),
        Err(SendError::MalformedStream(_))
    ));
}

#[test]
fn test_deep_placeholder_chain_is_rebased() {
    // Inode numbers run opposite to depth, so every parent starts as an orphan.
    let mut builder = TreeBuilder::new("snap");
    builder
        .dir(400, 256, "a")
        .dir(350, 400, "b")
        .dir(300, 350, "c")
        .file(257, 300, "f", b"deep")
        .file(500, 300, "g", b"late");
    let tree = builder.build();
    let commands = assert_round_trip(&tree, &SendConfig::default());

    let creates: HashMap<u64, usize> = commands
        .iter()
        .filter(|c| c.cmd.is_create())
        .fold(HashMap::new(), |mut m, c| {
            *m.entry(c.get_u64(Attribute::Ino).unwrap()).or_default() += 1;
            m
        });
    assert_eq!(creates.len(), 6 - 1);
    assert!(creates.values().all(|n| *n == 1));

    // g is named after the whole chain has its final names.
    let g = commands
        .iter()
        .find(|c| c.cmd == Command::Rename && attr(c, Attribute::PathTo).ends_with(b"/g"))
        .unwrap();
    assert_eq!(attr(g, Attribute::PathTo), b"a/b/c/g");
}

#[test]
fn test_special_files_and_xattrs_round_trip() {
    let mut builder = TreeBuilder::new("snap");
    builder
        .dir(257, 256, "dev")
        .special(258, 257, "null", S_IFCHR | 0o666, (1 << 20) | 3)
        .special(259, 257, "fifo", S_IFIFO | 0o600, 0)
        .symlink(260, 256, "bin", "usr/bin")
        .file(261, 256, "setuid", b"#!")
        .xattr(261, "security.capability", b"\x01\x00")
        .xattr(261, "user.comment", b"hi")
        .xattr(256, "user.root", b"r");
    builder.inode(261, |inode| {
        inode.mode = S_IFREG | 0o4755;
        inode.uid = 1000;
        inode.gid = 1000;
    });
    assert_round_trip(&builder.build(), &SendConfig::default());
}

#[test]
fn test_extrefs_round_trip() {
    let mut builder = TreeBuilder::new("snap").use_extrefs(true);
    builder
        .dir(300, 256, "d")
        .file(257, 300, "f", b"one")
        .hardlink(257, 256, "g")
        .hardlink(257, 300, "h");
    let commands = assert_round_trip(&builder.build(), &SendConfig::default());
    assert_eq!(
        commands.iter().filter(|c| c.cmd == Command::Link).count(),
        2
    );
}

#[test]
fn test_rename_and_link_sources_exist() {
    let mut builder = TreeBuilder::new("snap").max_inline(16);
    builder
        .dir(270, 256, "top")
        .dir(260, 270, "mid")
        .file(257, 260, "a", &[1u8; 100])
        .hardlink(257, 270, "a2")
        .hardlink(257, 256, "a3")
        .symlink(258, 260, "s", "a");
    let tree = builder.build();
    let (out, _) = send_to_vec(&tree, &small_buffers()).unwrap();
    let commands = decode_stream(&out).unwrap();
    // The replay rejects a rename or link whose source does not exist yet.
    replay(&commands).unwrap();
}

#[tokio::test]
async fn test_mutation_during_suspension_is_detected() {
    let data = vec![0x5Au8; 64 * 1024];
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 256, "big", &data);
    let tree: Arc<MemoryTree> = Arc::new(builder.build());
    let extent_key = Key::new(257, EXTENT_DATA_KEY, 0);

    let session = SendSession::new();
    let mut stream = session.start(tree.clone(), small_buffers()).unwrap();
    // The producer is now parked inside the extent, with the tree unlocked.
    assert!(stream.next_chunk().await.unwrap().is_some());

    let mut changed = tree.remove_item(&extent_key).unwrap().to_vec();
    changed[RECORD_OFFSET_FIELD] ^= 1;
    tree.insert_item(extent_key, changed);

    let err = stream.next_chunk().await.unwrap_err();
    assert!(matches!(err, SendError::SubvolumeChanged { key } if key == extent_key));
    assert!(!session.is_running());
}

/// First byte of the regular extent's `offset` field.
const RECORD_OFFSET_FIELD: usize = 21 + 16;

#[tokio::test]
async fn test_removal_during_suspension_is_detected() {
    let data = vec![0xA5u8; 64 * 1024];
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 256, "big", &data);
    let tree = Arc::new(builder.build());
    let extent_key = Key::new(257, EXTENT_DATA_KEY, 0);

    let session = SendSession::new();
    let mut stream = session.start(tree.clone(), small_buffers()).unwrap();
    assert!(stream.next_chunk().await.unwrap().is_some());
    tree.remove_item(&extent_key);

    let err = stream.next_chunk().await.unwrap_err();
    assert!(matches!(err, SendError::MissingItem { .. }));
    assert_eq!(err.class(), sendstream::ErrorClass::Integrity);
}

#[tokio::test]
async fn test_dropped_consumer_stops_producer() {
    let data = vec![1u8; 64 * 1024];
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 256, "big", &data);
    let tree = Arc::new(builder.build());

    let session = SendSession::new();
    let mut stream = session.start(tree.clone(), small_buffers()).unwrap();
    assert!(stream.next_chunk().await.unwrap().is_some());
    stream.cancel().await;

    // The tree is unlocked and a new send can start.
    tree.insert_item(Key::new(999, 1, 0), vec![0u8; 4]);
    tree.remove_item(&Key::new(999, 1, 0));
    let mut again = session.start(tree, small_buffers()).unwrap();
    let stats = again.copy_to(&mut tokio::io::sink()).await.unwrap();
    assert_eq!(stats.data_bytes, data.len() as u64);
}

#[tokio::test]
async fn test_oversized_buffer_settings_are_rejected() {
    let mut builder = TreeBuilder::new("snap");
    builder.file(257, 256, "f", b"data");
    let tree = Arc::new(builder.build());
    let config = SendConfig {
        high_water: usize::MAX,
        ..SendConfig::default()
    };

    let err = send_to_vec(&*tree, &config).unwrap_err();
    assert!(matches!(err, SendError::Config(_)));

    let session = SendSession::new();
    assert!(matches!(session.start(tree.clone(), config.clone()), Err(SendError::Config(_))));
    assert!(!session.is_running());
    assert!(session.start(tree, SendConfig::default()).is_ok());
}
