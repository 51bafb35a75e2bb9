//! Wire codec throughput: envelope and command encode/decode, pipelined
//! frame scanning, subject matching and pooled message reuse.

use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use hubmq::core::command::{decode_command, encode_command_frame, new_add};
use hubmq::core::frame::try_decode_frame;
use hubmq::core::message::{decode_message, encode_message_frame, Message};
use hubmq::core::pool::MessagePool;
use hubmq::core::subscription::SubscriptionTable;

fn sample_message() -> Message {
    let mut msg = Message::application(
        vec![
            ("orders".to_string(), Some("eu".to_string())),
            ("billing".to_string(), None),
        ],
        Bytes::from_static(&[42u8; 256]),
    );
    msg.sent_at_ms = 1_724_000_000_000;
    msg
}

fn bench_envelope_codec(c: &mut Criterion) {
    let msg = sample_message();
    let frame = encode_message_frame(&msg).unwrap();

    let mut group = c.benchmark_group("envelope");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| encode_message_frame(black_box(&msg)).unwrap())
    });
    group.bench_function("decode", |b| {
        b.iter(|| decode_message(black_box(&frame[4..])).unwrap())
    });
    group.finish();
}

fn bench_command_codec(c: &mut Criterion) {
    let cmd = new_add(7, "orders", Some(vec!["eu".into(), "us".into()]));
    let frame = encode_command_frame(&cmd).unwrap();

    let mut group = c.benchmark_group("command");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| encode_command_frame(black_box(&cmd)).unwrap())
    });
    group.bench_function("decode", |b| {
        b.iter(|| decode_command(black_box(&frame[4..])).unwrap())
    });
    group.finish();
}

fn bench_frame_scan(c: &mut Criterion) {
    // A buffer holding 64 pipelined frames, as the read path sees them.
    let one = encode_message_frame(&sample_message()).unwrap();
    let mut pipelined = BytesMut::with_capacity(one.len() * 64);
    for _ in 0..64 {
        pipelined.extend_from_slice(&one);
    }

    let mut group = c.benchmark_group("frame");
    group.throughput(Throughput::Bytes(pipelined.len() as u64));
    group.bench_function("scan_64", |b| {
        b.iter(|| {
            let mut buf = pipelined.clone();
            let mut frames = 0;
            while let Some(frame) = try_decode_frame(&mut buf).unwrap() {
                black_box(&frame);
                frames += 1;
            }
            assert_eq!(frames, 64);
        })
    });
    group.finish();
}

fn bench_subscription_match(c: &mut Criterion) {
    let mut table = SubscriptionTable::new();
    for n in 0..128 {
        table.add(&format!("subject-{n}"), Some(&[format!("key-{n}")]));
    }
    table.add("orders", Some(&["eu".to_string()]));

    let matching = vec![("orders".to_string(), Some("eu".to_string()))];
    let missing = vec![("unknown".to_string(), Some("x".to_string()))];

    let mut group = c.benchmark_group("subscription");
    group.bench_function("match_hit", |b| {
        b.iter(|| table.matches(black_box(&matching)))
    });
    group.bench_function("match_miss", |b| {
        b.iter(|| table.matches(black_box(&missing)))
    });
    group.finish();
}

fn bench_message_pool(c: &mut Criterion) {
    let pool = MessagePool::new(1024);

    let mut group = c.benchmark_group("pool");
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let msg = pool.acquire();
            pool.release(black_box(msg));
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_codec,
    bench_command_codec,
    bench_frame_scan,
    bench_subscription_match,
    bench_message_pool
);
criterion_main!(benches);
