// Accumulation Benchmark Suite
//
// Measures feature building + grid assignment throughput, sequential versus the
// partitioned rayon fold, and a full partition run over the sample fixture.
//
// Run with: cargo bench --package footprint-tiles-core --bench accumulate

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use footprint_tiles_core::accumulate::{accumulate_batch, accumulate_rows};
use footprint_tiles_core::grid::GridSize;
use footprint_tiles_core::pipeline::{partition_dataset, PartitionConfig};
use footprint_tiles_core::reader::Row;
use std::path::Path;

// Fixture path (relative to crates/core/)
const FIXTURE_SAMPLE: &str = "../../tests/fixtures/open-buildings-sample.csv";

/// Synthetic footprints scattered over roughly a 1° square around Accra.
fn synthetic_rows(count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let lng = -0.7 + (i % 997) as f64 * 0.001;
            let lat = 5.2 + (i % 991) as f64 * 0.001;
            let wkt = format!(
                "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
                x0 = lng,
                y0 = lat,
                x1 = lng + 0.0001,
                y1 = lat + 0.0001
            );
            Row::from_wkt(i, &wkt, 42.0, 0.8, "6CQXRRV6+9GJ")
        })
        .collect()
}

fn bench_batch_accumulation(c: &mut Criterion) {
    let grid = GridSize::default();
    let mut group = c.benchmark_group("accumulate");

    for count in [10_000, 100_000] {
        let rows = synthetic_rows(count);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("sequential", count), &rows, |b, rows| {
            b.iter(|| black_box(accumulate_rows(rows, grid)))
        });
        group.bench_with_input(BenchmarkId::new("parallel", count), &rows, |b, rows| {
            b.iter(|| black_box(accumulate_batch(rows, grid)))
        });
    }

    group.finish();
}

fn bench_sample_partition(c: &mut Criterion) {
    if !Path::new(FIXTURE_SAMPLE).exists() {
        eprintln!("Skipping partition benchmark: fixture not found");
        return;
    }

    c.bench_function("partition_sample_csv", |b| {
        b.iter(|| {
            let out = tempfile::tempdir().expect("Should create temp dir");
            let stats = partition_dataset(
                Path::new(FIXTURE_SAMPLE),
                out.path(),
                &PartitionConfig::default(),
            )
            .expect("Pipeline should work");
            black_box(stats)
        })
    });
}

criterion_group!(benches, bench_batch_accumulation, bench_sample_partition);
criterion_main!(benches);
