use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sendstream::stream::decode_stream;
use sendstream::tree::{MemoryTree, TreeBuilder};
use sendstream::{send_to_vec, SendConfig};

/// `dirs` directories of `files_per_dir` files, each `file_size` bytes.
fn make_tree(dirs: u64, files_per_dir: u64, file_size: usize) -> MemoryTree {
    let mut builder = TreeBuilder::new("bench");
    let data: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8).collect();
    let mut ino = 257;
    for d in 0..dirs {
        let dir = ino;
        ino += 1;
        builder.dir(dir, 256, format!("dir{}", d));
        for f in 0..files_per_dir {
            builder.file(ino, dir, format!("file{}", f), &data);
            ino += 1;
        }
    }
    builder.build()
}

/// Same shape, but every directory has a higher inode than its files.
fn make_inverted_tree(dirs: u64, files_per_dir: u64) -> MemoryTree {
    let mut builder = TreeBuilder::new("bench");
    let first_dir = 257 + dirs * files_per_dir;
    for d in 0..dirs {
        let dir = first_dir + d;
        builder.dir(dir, 256, format!("dir{}", d));
        for f in 0..files_per_dir {
            builder.file(257 + d * files_per_dir + f, dir, format!("file{}", f), b"x");
        }
    }
    builder.build()
}

fn bench_metadata_heavy(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_metadata");

    for file_count in [100u64, 1000, 5000].iter() {
        let tree = make_tree(file_count / 50, 50, 16);
        group.throughput(Throughput::Elements(*file_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(file_count),
            file_count,
            |b, _| {
                b.iter(|| send_to_vec(black_box(&tree), &SendConfig::default()).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_orphan_parents(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_orphan_parents");

    for file_count in [100u64, 1000, 5000].iter() {
        let tree = make_inverted_tree(file_count / 50, 50);
        group.bench_with_input(
            BenchmarkId::from_parameter(file_count),
            file_count,
            |b, _| {
                b.iter(|| send_to_vec(black_box(&tree), &SendConfig::default()).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_content(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_content");

    for size in [64 * 1024usize, 1024 * 1024, 8 * 1024 * 1024].iter() {
        let tree = make_tree(1, 4, *size);
        group.throughput(Throughput::Bytes((*size * 4) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| send_to_vec(black_box(&tree), &SendConfig::default()).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let tree = make_tree(20, 50, 4096);
    let (stream, _) = send_to_vec(&tree, &SendConfig::default()).unwrap();

    c.bench_function("decode_stream", |b| {
        b.iter(|| decode_stream(black_box(&stream)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_metadata_heavy,
    bench_orphan_parents,
    bench_content,
    bench_decode
);
criterion_main!(benches);
