use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tessera_icc::{BroadcastWriter, RingConfig};
use tessera_perf::make_test_payload;

const PAYLOAD_LEN: usize = 64;

fn bench_publish(c: &mut Criterion) {
    let mut writer = BroadcastWriter::new(RingConfig::new(65536));
    let payload = make_test_payload(PAYLOAD_LEN);

    let mut group = c.benchmark_group("broadcast");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push", |b| {
        b.iter(|| writer.push(black_box(&payload)));
    });

    group.finish();
}

fn bench_try_read_data(c: &mut Criterion) {
    let mut writer = BroadcastWriter::new(RingConfig::new(1 << 20));
    let mut reader = writer.subscribe();
    let payload = make_test_payload(PAYLOAD_LEN);
    let mut buf = Vec::with_capacity(PAYLOAD_LEN);

    let mut group = c.benchmark_group("broadcast");
    group.throughput(Throughput::Elements(1));

    group.bench_function("try_read_into (data)", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = std::time::Duration::ZERO;
            // Refill in chunks that fit, so the reader is never lapped.
            let per_fill = (writer.capacity() / (PAYLOAD_LEN + 8)) as u64;
            let mut left = iters;
            while left > 0 {
                let n = left.min(per_fill);
                for _ in 0..n {
                    writer.push(&payload);
                }
                let start = std::time::Instant::now();
                for _ in 0..n {
                    black_box(reader.try_read_into(&mut buf));
                }
                elapsed += start.elapsed();
                left -= n;
            }
            elapsed
        });
    });

    group.finish();
}

fn bench_try_read_empty(c: &mut Criterion) {
    let writer = BroadcastWriter::new(RingConfig::new(65536));
    let mut reader = writer.subscribe();
    let mut buf = Vec::new();

    let mut group = c.benchmark_group("broadcast");
    group.throughput(Throughput::Elements(1));

    group.bench_function("try_read_into (empty)", |b| {
        b.iter(|| black_box(reader.try_read_into(&mut buf)));
    });

    group.finish();
}

fn bench_round_trip_capacities(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_capacity");
    group.throughput(Throughput::Elements(1));
    let payload = make_test_payload(PAYLOAD_LEN);

    for &cap in &[1024usize, 4096, 16384, 65536] {
        let mut writer = BroadcastWriter::new(RingConfig::new(cap));
        let mut reader = writer.subscribe();
        let mut buf = Vec::with_capacity(PAYLOAD_LEN);

        group.bench_function(format!("round_trip_cap_{cap}"), |b| {
            b.iter(|| {
                writer.push(black_box(&payload));
                black_box(reader.try_read_into(&mut buf));
            });
        });
    }

    group.finish();
}

/// Cost of the overrun path: a reader lapped on every read.
fn bench_overrun_resync(c: &mut Criterion) {
    let mut writer = BroadcastWriter::new(RingConfig::new(1024));
    let payload = make_test_payload(PAYLOAD_LEN);

    let mut group = c.benchmark_group("broadcast");
    group.bench_function("overrun_resync", |b| {
        b.iter_batched(
            || {
                let reader = writer.subscribe();
                for _ in 0..32 {
                    writer.push(&payload);
                }
                reader
            },
            |mut reader| black_box(reader.try_read()),
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_publish,
    bench_try_read_data,
    bench_try_read_empty,
    bench_round_trip_capacities,
    bench_overrun_resync,
);
criterion_main!(benches);
