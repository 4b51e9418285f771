//! Big-map throughput on both backends.
//!
//! Measures point writes, point reads (with and without the hot-entry
//! cache) and ordered iteration over synthetic vocabularies.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use knowledge_store::{BigMap, Engine, MapOptions, StorageConfiguration, StorageEngine, StorageHint};
use rand::prelude::*;
use tempfile::TempDir;

// === Synthetic Data Generation ===

fn random_words(n: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let len = rng.gen_range(3..12);
            (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
        })
        .collect()
}

fn engines(root: &TempDir) -> Vec<(&'static str, Engine)> {
    vec![
        (
            "in_memory",
            StorageConfiguration::in_memory(root.path().join("mem"))
                .open("bench")
                .unwrap(),
        ),
        (
            "disk",
            StorageConfiguration::disk(root.path().join("disk"))
                .open("bench")
                .unwrap(),
        ),
        (
            "disk_cached",
            StorageConfiguration::disk(root.path().join("cached"))
                .with_cache_size(4096)
                .open("bench")
                .unwrap(),
        ),
    ]
}

fn bench_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("big_map_put");
    let words = random_words(1_000, 42);
    group.throughput(Throughput::Elements(words.len() as u64));

    let root = TempDir::new().unwrap();
    for (name, engine) in engines(&root) {
        let map: BigMap<String, u64> = engine
            .get_big_map("counts", MapOptions::hash_map().hint(StorageHint::InCache))
            .unwrap();
        group.bench_with_input(BenchmarkId::new(name, words.len()), &words, |b, words| {
            b.iter(|| {
                for (i, w) in words.iter().enumerate() {
                    map.put(w.clone(), i as u64).unwrap();
                }
            })
        });
    }
    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("big_map_get");
    let words = random_words(10_000, 7);
    let mut rng = StdRng::seed_from_u64(99);
    // Skewed lookups: a small hot set dominates, as in vocabulary lookups
    let lookups: Vec<&String> = (0..1_000)
        .map(|_| {
            if rng.gen_bool(0.9) {
                &words[rng.gen_range(0..256)]
            } else {
                &words[rng.gen_range(0..words.len())]
            }
        })
        .collect();
    group.throughput(Throughput::Elements(lookups.len() as u64));

    let root = TempDir::new().unwrap();
    for (name, engine) in engines(&root) {
        let map: BigMap<String, u64> = engine
            .get_big_map("counts", MapOptions::hash_map().hint(StorageHint::InCache))
            .unwrap();
        map.extend(words.iter().cloned().zip(0u64..)).unwrap();
        group.bench_function(BenchmarkId::new(name, words.len()), |b| {
            b.iter(|| {
                for w in &lookups {
                    black_box(map.get(w).unwrap());
                }
            })
        });
    }
    group.finish();
}

fn bench_ordered_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_map_for_each");
    for n in [1_000u64, 10_000] {
        group.throughput(Throughput::Elements(n));
        let root = TempDir::new().unwrap();
        for (name, engine) in engines(&root) {
            let map: BigMap<u64, f64> = engine
                .get_big_map("weights", MapOptions::tree_map().hint(StorageHint::InDisk))
                .unwrap();
            map.extend((0..n).map(|i| (i, i as f64 * 0.5))).unwrap();
            group.bench_function(BenchmarkId::new(name, n), |b| {
                b.iter(|| {
                    let mut sum = 0.0;
                    map.for_each(|_, v| {
                        sum += v;
                        Ok(())
                    })
                    .unwrap();
                    black_box(sum)
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_writes, bench_reads, bench_ordered_iteration);
criterion_main!(benches);
