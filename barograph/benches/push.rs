//! Benchmarks for the write path and packed reading codec.
//!
//! Run with: `cargo bench -p barograph -- push`

#![allow(missing_docs)]

use barograph::{PosixTime, PosixTimeRange, Reading, ReadingValues, Store, StoreConfig};
use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tempfile::tempdir;

const BASE: i32 = 1_700_000_400;

fn readings(start: i32, count: i32) -> Vec<Reading> {
    (0..count)
        .map(|i| {
            let values = ReadingValues {
                temperature: 12.0 + f64::from(i % 100) / 10.0,
                pressure: 101_325.0 - f64::from(i % 40),
                humidity: 0.55,
                wind_speed: f64::from(i % 12),
                wind_direction: f64::from(i % 360),
            };
            Reading::at(PosixTime::new(start + i), values)
        })
        .collect()
}

fn bench_pack(c: &mut Criterion) {
    let values = readings(BASE, 1)[0].values;
    let packed = values.pack();

    c.bench_function("codec/pack", |b| b.iter(|| black_box(&values).pack()));
    c.bench_function("codec/unpack", |b| {
        b.iter(|| ReadingValues::unpack(black_box(&packed)).unwrap());
    });
}

fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("push/readings");
    group.sample_size(20);

    for count in [600, 3_600, 86_400] {
        let batch = readings(BASE, count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter_batched(
                || {
                    let dir = tempdir().unwrap();
                    let store = Store::open(StoreConfig::new(dir.path().join("bench.db"))).unwrap();
                    (dir, store)
                },
                |(_dir, mut store)| store.push_readings("bench", black_box(batch), true).unwrap(),
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

fn bench_adjust_offset(c: &mut Criterion) {
    let mut group = c.benchmark_group("adjust/offset");
    group.sample_size(10);

    let mut store = Store::open_in_memory().unwrap();
    store.push_readings("bench", &readings(BASE, 3_600), true).unwrap();
    let mut current = PosixTimeRange::new(PosixTime::new(BASE), PosixTime::new(BASE + 3_599));

    group.bench_function("one_hour_by_30s", |b| {
        b.iter(|| {
            let corrected = PosixTimeRange::new(
                PosixTime::new(current.low.secs() + 30),
                PosixTime::new(current.high.secs() + 30),
            );
            store
                .adjust_stamps("bench", current, corrected, true)
                .unwrap();
            current = corrected;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pack, bench_push, bench_adjust_offset);
criterion_main!(benches);
