//! Wire codec benchmarks: encode/decode throughput across frame types and
//! payload sizes.

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use streamline::wire::{AckFrameBody, DataFrame, Frame, MessageBody};

fn data_frame(size: usize) -> Frame {
    Frame {
        src_conn_id: 0xAAAA_AAAA,
        dst_conn_id: 0xBBBB_BBBB,
        body: MessageBody::Data(DataFrame {
            stream_id: 3,
            packet_number: 42,
            offset: 1024,
            fin: false,
            ciphertext: Bytes::from(vec![0u8; size]),
            tag: [0u8; 16],
            nonce: [0u8; 12],
        }),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [0, 64, 256, 1024, 1350, 4096] {
        let frame = data_frame(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                let mut out = Vec::new();
                streamline::wire::encode(black_box(frame), &mut out);
                black_box(out);
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [0, 64, 256, 1024, 1350, 4096] {
        let frame = data_frame(size);
        let mut encoded = Vec::new();
        streamline::wire::encode(&frame, &mut encoded);

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, bytes| {
            b.iter(|| {
                let decoded = black_box(streamline::wire::decode(bytes).unwrap());
                black_box(decoded);
            });
        });
    }
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("roundtrip");
    for size in [0, 64, 256, 1024, 1350] {
        let frame = data_frame(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                let mut out = Vec::new();
                streamline::wire::encode(black_box(frame), &mut out);
                let decoded = black_box(streamline::wire::decode(&out).unwrap());
                black_box(decoded);
            });
        });
    }
    group.finish();
}

fn bench_ack_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("ack_frame");
    for range_count in [1, 16, 64, 171] {
        let body = AckFrameBody {
            largest: 10_000,
            ranges: (0..range_count).map(|i| (i % 7) as u64 + 1).collect(),
        };
        let frame = Frame {
            src_conn_id: 1,
            dst_conn_id: 2,
            body: MessageBody::Ack(body),
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(range_count),
            &frame,
            |b, frame| {
                b.iter(|| {
                    let mut out = Vec::new();
                    streamline::wire::encode(black_box(frame), &mut out);
                    let decoded = black_box(streamline::wire::decode(&out).unwrap());
                    black_box(decoded);
                });
            },
        );
    }
    group.finish();
}

fn bench_message_types(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_types");

    let bodies = [
        ("dial", MessageBody::Dial { sealed_box: Bytes::from(vec![0u8; 80]) }),
        ("dialconf", MessageBody::DialConf { sealed_box: Bytes::from(vec![0u8; 48]) }),
        ("conf", MessageBody::Conf),
        ("rst", MessageBody::Rst),
        ("skip_stream", MessageBody::SkipStream { stream_id: 1, offset: 512 }),
        ("flush_stream", MessageBody::FlushStream { stream_id: 1, offset: 512 }),
        ("flush_conf", MessageBody::FlushConf { stream_id: 1 }),
        ("close", MessageBody::Close { reason: 7 }),
        ("closeconf", MessageBody::CloseConf),
    ];

    for (name, body) in bodies {
        let frame = Frame {
            src_conn_id: 1,
            dst_conn_id: 2,
            body,
        };
        group.bench_with_input(BenchmarkId::new("encode", name), &frame, |b, frame| {
            b.iter(|| {
                let mut out = Vec::new();
                streamline::wire::encode(black_box(frame), &mut out);
                black_box(out);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_roundtrip,
    bench_ack_frame,
    bench_message_types
);

criterion_main!(benches);
