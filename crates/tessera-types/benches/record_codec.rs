//! Criterion micro-benchmarks for the record codec.
//!
//! Benchmarks:
//! - varint encode/decode across the length bands
//! - record encode/decode for narrow and wide rows

use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use tessera_types::{SqliteValue, decode_record, encode_record, get_varint, put_varint};

fn criterion_config() -> Criterion {
    Criterion::default().configure_from_args()
}

fn mixed_row(width: usize) -> Vec<SqliteValue> {
    (0..width)
        .map(|i| match i % 5 {
            0 => SqliteValue::Integer(i64::try_from(i).unwrap_or(0) * 1_000_003),
            1 => SqliteValue::Text(format!("value-{i}")),
            2 => SqliteValue::Float(f64::from(u32::try_from(i).unwrap_or(0)) * 0.5),
            3 => SqliteValue::Null,
            _ => SqliteValue::Blob(vec![0xAB; i % 64]),
        })
        .collect()
}

fn bench_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(3));

    for value in [0x7F_u64, 0x3FFF, 0x0FFF_FFFF, u64::MAX] {
        group.bench_with_input(BenchmarkId::new("put", value), &value, |b, &v| {
            let mut out = Vec::with_capacity(9);
            b.iter(|| {
                out.clear();
                black_box(put_varint(&mut out, black_box(v)));
            });
        });

        let mut encoded = Vec::new();
        put_varint(&mut encoded, value);
        group.bench_with_input(BenchmarkId::new("get", value), &encoded, |b, bytes| {
            b.iter(|| black_box(get_varint(black_box(bytes))));
        });
    }
    group.finish();
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    for width in [4_usize, 32, 200] {
        let row = mixed_row(width);
        let encoded = encode_record(&row).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", width), &row, |b, row| {
            b.iter(|| black_box(encode_record(black_box(row)).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", width), &encoded, |b, bytes| {
            b.iter(|| black_box(decode_record(black_box(bytes)).unwrap()));
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_varint, bench_record
}
criterion_main!(benches);
