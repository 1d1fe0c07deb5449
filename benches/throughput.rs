//! Throughput Benchmark for kvbridge
//!
//! This benchmark measures the wire codec: building request frames and
//! decoding reply frames of various sizes.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kvbridge::protocol::{decode, Entry, EntryShape, Reply, Request};

/// Benchmark SET encoding
fn bench_encode_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let request = Request::set(format!("key:{}", i), "small_value");
            black_box(request.encode().unwrap());
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let value = Bytes::from("x".repeat(1024)); // 1KB value
        b.iter(|| {
            let request = Request::set("key:medium", value.clone());
            black_box(request.encode().unwrap());
        });
    });

    group.bench_function("set_large", |b| {
        let value = Bytes::from("x".repeat(64 * 1024)); // 64KB value
        b.iter(|| {
            let request = Request::set("key:large", value.clone());
            black_box(request.encode().unwrap());
        });
    });

    group.bench_function("set_reused_buffer", |b| {
        let mut buf = BytesMut::with_capacity(4096);
        let request = Request::set("key:reused", "small_value");
        b.iter(|| {
            buf.clear();
            request.encode_into(&mut buf).unwrap();
            black_box(buf.len());
        });
    });

    group.finish();
}

/// Benchmark cursor request encoding
fn bench_encode_cursor(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_cursor");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_ff", |b| {
        b.iter(|| {
            black_box(Request::get_forward("scan", 100).encode().unwrap());
        });
    });

    group.bench_function("get_keys_prefix", |b| {
        b.iter(|| {
            black_box(
                Request::get_keys_prefix("scan", "user:", 100)
                    .encode()
                    .unwrap(),
            );
        });
    });

    group.finish();
}

fn page(entries: usize, value_len: usize) -> Bytes {
    let value = Bytes::from("v".repeat(value_len));
    let entries = (0..entries)
        .map(|i| Entry::new(format!("key:{:08}", i), value.clone()))
        .collect();
    Reply::ok_with(entries).encode().unwrap()
}

/// Benchmark reply decoding
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let single = page(1, 16);
    group.throughput(Throughput::Elements(1));
    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(decode(&single, EntryShape::KeyValue).unwrap()));
    });

    let not_found = Reply::NotFound.encode().unwrap();
    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(decode(&not_found, EntryShape::KeyValue).unwrap()));
    });

    let full_page = page(1000, 64);
    group.throughput(Throughput::Bytes(full_page.len() as u64));
    group.bench_function("page_1000x64", |b| {
        b.iter(|| black_box(decode(&full_page, EntryShape::KeyValue).unwrap()));
    });

    let keys = Reply::ok_with(
        (0..1000)
            .map(|i| Entry::key_only(format!("key:{:08}", i)))
            .collect(),
    )
    .encode()
    .unwrap();
    group.throughput(Throughput::Bytes(keys.len() as u64));
    group.bench_function("keys_1000", |b| {
        b.iter(|| black_box(decode(&keys, EntryShape::KeysOnly).unwrap()));
    });

    let large = page(1, 64 * 1024);
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("value_64k", |b| {
        b.iter(|| black_box(decode(&large, EntryShape::KeyValue).unwrap()));
    });

    group.finish();
}

/// Benchmark rejection of corrupt frames
fn bench_reject(c: &mut Criterion) {
    let full_page = page(100, 64);
    let truncated = full_page.slice(..full_page.len() - 1);

    let mut group = c.benchmark_group("reject");
    group.throughput(Throughput::Elements(1));

    group.bench_function("truncated_page", |b| {
        b.iter(|| black_box(decode(&truncated, EntryShape::KeyValue).is_err()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_set,
    bench_encode_cursor,
    bench_decode,
    bench_reject,
);

criterion_main!(benches);
