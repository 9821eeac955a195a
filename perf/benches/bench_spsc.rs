use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tessera_icc::{RingConfig, copy_in, copy_out, fixed, spsc};
use tessera_perf::make_test_payload;

fn bench_round_trip_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc");

    for &len in &[16usize, 64, 256, 1024] {
        let (mut tx, mut rx) = spsc::channel(RingConfig::new(65536));
        let payload = make_test_payload(len);
        let mut buf = Vec::with_capacity(len);

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("push_pop", len), &len, |b, _| {
            b.iter(|| {
                tx.push(black_box(&payload));
                black_box(rx.pop_into(&mut buf));
            });
        });
    }

    group.finish();
}

fn bench_push_full(c: &mut Criterion) {
    let (mut tx, _rx) = spsc::channel(RingConfig::new(1024));
    let payload = make_test_payload(64);
    while tx.push(&payload) {}

    let mut group = c.benchmark_group("spsc");
    group.throughput(Throughput::Elements(1));
    group.bench_function("try_push (full)", |b| {
        b.iter(|| black_box(tx.try_push(black_box(&payload))));
    });
    group.finish();
}

fn bench_fixed(c: &mut Criterion) {
    let (mut tx, mut rx) = fixed::channel::<[u64; 4]>(RingConfig::new(1024));
    let batch = [[7u64; 4]; 16];

    let mut group = c.benchmark_group("fixed");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push_one_pop_one", |b| {
        b.iter(|| {
            tx.push_one(black_box([1, 2, 3, 4]));
            black_box(rx.pop_one());
        });
    });

    group.throughput(Throughput::Elements(batch.len() as u64));
    group.bench_function("push_many_pop_many_16", |b| {
        b.iter(|| {
            tx.push_many(black_box(&batch));
            black_box(rx.pop_many(batch.len()));
        });
    });
    group.finish();
}

fn bench_wrap_copy(c: &mut Criterion) {
    let mut ring = vec![0u8; 4096];
    let src = make_test_payload(256);
    let mut dst = vec![0u8; 256];

    let mut group = c.benchmark_group("wrap");
    group.throughput(Throughput::Bytes(256));
    for (name, offset) in [("contiguous", 1024usize), ("split", 4096 - 100)] {
        group.bench_function(format!("copy_in_{name}"), |b| {
            b.iter(|| copy_in(&mut ring, black_box(offset), &src));
        });
        group.bench_function(format!("copy_out_{name}"), |b| {
            b.iter(|| copy_out(&ring, black_box(offset), &mut dst));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip_sizes,
    bench_push_full,
    bench_fixed,
    bench_wrap_copy,
);
criterion_main!(benches);
