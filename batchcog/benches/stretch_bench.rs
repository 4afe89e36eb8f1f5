//! Benchmarks for the per-band linear stretch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use batchcog::stages::composite::{band_range, linear_stretch};
use batchcog::testing::gradient;

fn bench_stretch(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_stretch");
    for side in [256usize, 1024] {
        let band = gradient(side, side, 4000.0);
        group.bench_with_input(BenchmarkId::from_parameter(side), &band, |b, band| {
            b.iter(|| linear_stretch(black_box(band)));
        });
    }
    group.finish();
}

fn bench_range(c: &mut Criterion) {
    let band = gradient(1024, 1024, 65535.0);
    c.bench_function("band_range_1024", |b| b.iter(|| band_range(black_box(&band))));
}

criterion_group!(benches, bench_stretch, bench_range);
criterion_main!(benches);
