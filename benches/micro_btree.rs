//! Micro benchmarks for the copy-on-write B-tree.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::ops::Bound;
use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;
use tessera::primitives::block::{BlockStore, FileBlockStore, MemBlockStore};
use tessera::storage::btree::{BTree, TreeConfig, Value, Visit};

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: u64 = 512;

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(30);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                tree.insert_sequence(0, INSERT_COUNT);
                black_box(tree.tree.height());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                tree.insert_keys(&random_keys);
                black_box(tree.tree.height());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("delete_random", |b| {
        b.iter_batched(
            || {
                let mut tree = FreshTree::new();
                tree.insert_sequence(0, INSERT_COUNT);
                tree
            },
            |mut tree| {
                tree.delete_keys(&random_keys);
                black_box(tree.tree.height());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("commit_to_file", |b| {
        b.iter_batched(
            FileTree::new,
            |mut tree| {
                for key in 0..INSERT_COUNT {
                    tree.tree
                        .put(&key.to_be_bytes(), &value(key))
                        .expect("insert");
                }
                black_box(tree.tree.commit().expect("commit"));
            },
            BatchSize::SmallInput,
        );
    });

    let mut lookup_harness = LoadedTree::new(INSERT_COUNT);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| lookup_harness.point_lookup(LOOKUP_SAMPLES));
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| lookup_harness.range_scan(RANGE_WIDTH));
    });

    group.finish();
}

fn value(key: u64) -> Value {
    Value::new(1, key.to_le_bytes().to_vec())
}

struct FreshTree {
    tree: BTree,
}

impl FreshTree {
    fn new() -> Self {
        let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
        let tree = BTree::open(&store, TreeConfig::default()).expect("tree");
        Self { tree }
    }

    fn insert_sequence(&mut self, start: u64, count: u64) {
        for key in start..(start + count) {
            self.tree
                .put(&key.to_be_bytes(), &value(key))
                .expect("insert");
        }
        self.tree.commit().expect("commit");
    }

    fn insert_keys(&mut self, keys: &[u64]) {
        for key in keys {
            self.tree
                .put(&key.to_be_bytes(), &value(*key))
                .expect("insert");
        }
        self.tree.commit().expect("commit");
    }

    fn delete_keys(&mut self, keys: &[u64]) {
        for key in keys {
            self.tree.remove(&key.to_be_bytes()).expect("delete");
        }
        self.tree.commit().expect("commit");
    }
}

struct FileTree {
    _tmpdir: TempDir,
    tree: BTree,
}

impl FileTree {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let path = tmpdir.path().join("btree.tessera");
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(&path).expect("store"));
        let tree = BTree::open(&store, TreeConfig::default()).expect("tree");
        Self {
            _tmpdir: tmpdir,
            tree,
        }
    }
}

struct LoadedTree {
    tree: BTree,
    max_key: u64,
    rng: ChaCha8Rng,
}

impl LoadedTree {
    fn new(count: u64) -> Self {
        let mut fresh = FreshTree::new();
        fresh.insert_sequence(0, count);
        Self {
            tree: fresh.tree,
            max_key: count,
            rng: ChaCha8Rng::seed_from_u64(0xFEED_FACE),
        }
    }

    fn point_lookup(&mut self, samples: usize) {
        for _ in 0..samples {
            let key: u64 = self.rng.gen_range(0..self.max_key);
            black_box(self.tree.get(&key.to_be_bytes()).expect("get"));
        }
    }

    fn range_scan(&mut self, width: u64) {
        for _ in 0..16 {
            let start: u64 = self.rng.gen_range(0..(self.max_key - width));
            let lower = start.to_be_bytes();
            let upper = (start + width).to_be_bytes();
            self.tree
                .scan(
                    Bound::Included(&lower[..]),
                    Bound::Included(&upper[..]),
                    |entry| {
                        black_box(entry);
                        Visit::Continue
                    },
                )
                .expect("scan");
        }
    }
}

criterion_group!(benches, micro_btree);
criterion_main!(benches);
