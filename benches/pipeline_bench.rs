//! Benchmarks for the nightlights hot paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nightlights::pipeline::background::{compute_background, trimmed_stats};
use nightlights::pipeline::rewriter::densify;
use nightlights::storage::*;
use tempfile::tempdir;

fn create_values(count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| if i % 17 == 0 { f64::NAN } else { (i % 251) as f64 * 0.25 })
        .collect()
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let dir = tempdir().unwrap();

    for size in [1_000, 20_000] {
        let values = create_values(size);
        let path = dir.path().join(format!("bench_{}.gz", size));
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("write_f64_array", size), &values, |b, values| {
            b.iter(|| write_f64_array(&path, black_box(values)).unwrap())
        });

        write_f64_array(&path, &values).unwrap();
        group.bench_with_input(BenchmarkId::new("read_f64_array", size), &path, |b, path| {
            b.iter(|| read_f64_array(black_box(path)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("read_f64_sub_array", size), &path, |b, path| {
            b.iter(|| read_f64_sub_array(black_box(path), size / 2, size / 2 + 10).unwrap())
        });
    }

    group.finish();
}

fn bench_densify(c: &mut Criterion) {
    let mut group = c.benchmark_group("densify");

    for size in [10_000, 100_000] {
        // Every third entity observed, in reverse order
        let records: Vec<IdValue> = (0..size)
            .rev()
            .step_by(3)
            .map(|i| IdValue::new(i as i64, i as f64))
            .collect();
        group.throughput(Throughput::Elements(records.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &records, |b, records| {
            b.iter(|| densify(black_box(records), size).unwrap())
        });
    }

    group.finish();
}

fn bench_background(c: &mut Criterion) {
    let mut group = c.benchmark_group("background");

    let mut window = create_values(1000);
    window.retain(|v| !v.is_nan());
    group.bench_function("trimmed_stats_1000", |b| {
        b.iter_batched(
            || window.clone(),
            |mut values| trimmed_stats(black_box(&mut values), 0.25, 0.75),
            criterion::BatchSize::SmallInput,
        )
    });

    let darkspots = create_values(50_000);
    let lists: Vec<Vec<EntityId>> = (0..2_000u32)
        .map(|v| (0..40u32).map(|k| (v * 23 + k * 101) % 50_000).collect())
        .collect();
    let graph = MatchGraph::from_lists(1000, lists).unwrap();
    let date = DateKey::from_ymd(2004, 5, 1).unwrap();

    group.throughput(Throughput::Elements(graph.village_count() as u64));
    group.bench_function("compute_background_2000_villages", |b| {
        b.iter(|| compute_background(date, black_box(&darkspots), &graph, 0.25, 0.75).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_densify, bench_background);
criterion_main!(benches);
