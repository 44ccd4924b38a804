//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, Reply, METHOD_ROOM_MESSAGE};
use serde_json::json;

fn bench_encode_notice(c: &mut Criterion) {
    let notice = Reply::notice(
        METHOD_ROOM_MESSAGE,
        json!({"message": "guest joined the room, id: lobby."}),
    );

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("join_notice", |b| {
        b.iter(|| codec::encode(black_box(&notice)))
    });
    group.finish();
}

fn bench_decode_request(c: &mut Criterion) {
    let text = r#"{"method":"room.join","params":["lobby"],"id":17}"#;

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("join_request", |b| {
        b.iter(|| codec::decode_request(black_box(text)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode_notice, bench_decode_request);
criterion_main!(benches);
