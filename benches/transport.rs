//! Transport-layer performance benchmarks: buffer pooling, congestion
//! control, ACK range bookkeeping, AEAD sealing, and a full established
//! connection's send path.

use std::time::Instant;

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use streamline::ack::AckRanges;
use streamline::buffer::BufferPool;
use streamline::config::TransportConfig;
use streamline::congestion::CongestionController;
use streamline::crypto::{EphemeralKeypair, StaticKeypair};
use streamline::transport::{StreamTransport, TransportDelegate};

fn bench_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");

    group.bench_function("acquire", |b| {
        let pool = BufferPool::new(2048, 1024);
        b.iter(|| {
            let buffer = black_box(pool.acquire());
            black_box(buffer);
        });
    });

    group.bench_function("acquire_release", |b| {
        let pool = BufferPool::new(2048, 1024);
        b.iter(|| {
            let buffer = pool.acquire();
            drop(buffer);
        });
    });

    group.finish();
}

fn bench_congestion_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("congestion_control");

    group.bench_function("on_ack_slow_start", |b| {
        let mut controller = CongestionController::default();
        b.iter(|| {
            controller.on_ack(black_box(1024), black_box(true));
        });
    });

    group.bench_function("on_loss", |b| {
        let mut controller = CongestionController::default();
        b.iter(|| {
            black_box(controller.on_loss());
        });
    });

    group.finish();
}

fn bench_ack_ranges(c: &mut Criterion) {
    let mut group = c.benchmark_group("ack_ranges");

    group.bench_function("add_contiguous", |b| {
        b.iter(|| {
            let mut ranges = AckRanges::default();
            for pn in 0..200u64 {
                ranges.add(black_box(pn));
            }
            black_box(ranges);
        });
    });

    group.bench_function("add_out_of_order", |b| {
        b.iter(|| {
            let mut ranges = AckRanges::default();
            for pn in (0..200u64).rev() {
                ranges.add(black_box(pn));
            }
            black_box(ranges);
        });
    });

    group.bench_function("to_frame_body", |b| {
        let mut ranges = AckRanges::default();
        for pn in (0..400u64).step_by(2) {
            ranges.add(pn);
        }
        b.iter(|| {
            black_box(ranges.to_frame_body());
        });
    });

    group.finish();
}

fn bench_aead(c: &mut Criterion) {
    let mut group = c.benchmark_group("aead");

    for size in [64, 256, 1024, 1350, 4096] {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let bob_pub = bob.public_bytes();
        let mut session = alice.into_session(&bob_pub).unwrap();
        let plaintext = vec![0u8; size];
        let aad = [0u8; 28];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("seal", size), &plaintext, |b, data| {
            b.iter(|| {
                black_box(session.seal(black_box(data), black_box(&aad)).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_established_send(c: &mut Criterion) {
    #[derive(Default)]
    struct Null;
    impl TransportDelegate for Null {
        fn did_recv(&mut self, _stream_id: u16, _data: Bytes) {}
    }

    let mut group = c.benchmark_group("established_send");

    for size in [64, 256, 1024, 16_384] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let client_static = StaticKeypair::generate();
                let server_static = StaticKeypair::generate();
                let server_pub = server_static.public_bytes();
                let mut client = StreamTransport::new(TransportConfig::default(), client_static, Null);
                let mut server = StreamTransport::new(TransportConfig::default(), server_static, Null);
                let now = Instant::now();

                client.dial(server_pub, now);
                for _ in 0..8 {
                    if let Some(d) = client.poll_outbound() {
                        server.on_datagram(&d, now);
                    }
                    if let Some(d) = server.poll_outbound() {
                        client.on_datagram(&d, now);
                    }
                }

                client.send(0, Bytes::from(vec![0u8; size]), true, now).unwrap();
                client.poll_timers(now);
                while let Some(d) = client.poll_outbound() {
                    black_box(server.on_datagram(&d, now));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_buffer_pool,
    bench_congestion_control,
    bench_ack_ranges,
    bench_aead,
    bench_established_send
);

criterion_main!(benches);
