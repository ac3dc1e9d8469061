//! Benchmarks for the streaming merge engine
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use meridian::merge::{deduplicate_samples, merge_sort_blocks, SortBlock};

fn make_blocks(sources: usize, samples_per_source: usize) -> Vec<SortBlock> {
    (0..sources)
        .map(|source| SortBlock {
            timestamps: (0..samples_per_source)
                .map(|i| (i * sources + source) as i64)
                .collect(),
            values: (0..samples_per_source).map(|i| i as f64).collect(),
            next_idx: 0,
            source,
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for sources in [2, 8, 32] {
        let samples = 10_000;
        group.throughput(Throughput::Elements((sources * samples) as u64));

        group.bench_function(format!("merge_{sources}x{samples}"), |b| {
            let blocks = make_blocks(sources, samples);
            b.iter(|| {
                let mut ts = Vec::new();
                let mut vs = Vec::new();
                merge_sort_blocks(&mut ts, &mut vs, black_box(blocks.clone()), 0);
                (ts, vs)
            })
        });
    }

    group.finish();
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");

    let n = 100_000;
    group.throughput(Throughput::Elements(n as u64));

    group.bench_function("dedup_100k_interval_10", |b| {
        let timestamps: Vec<i64> = (0..n).map(|i| i as i64 * 3).collect();
        let values: Vec<f64> = (0..n).map(|i| i as f64).collect();
        b.iter(|| {
            let mut ts = timestamps.clone();
            let mut vs = values.clone();
            deduplicate_samples(black_box(&mut ts), &mut vs, 10);
            (ts, vs)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_merge, bench_dedup);
criterion_main!(benches);
