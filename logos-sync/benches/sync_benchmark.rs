use criterion::{criterion_group, criterion_main, Criterion};
use logos_sync::broadcast::BroadcastGroup;
use logos_sync::crdt::{Field, ReplicatedDocument, TextEdit};
use logos_sync::presence::{LocalUser, PresenceBroadcast};
use logos_sync::protocol::SyncMessage;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

/// A document with `n` characters typed one at a time, plus its operations.
fn typed_document(n: usize) -> (ReplicatedDocument, Vec<logos_sync::Operation>) {
    let mut doc = ReplicatedDocument::with_replica(Uuid::new_v4());
    let mut ops = Vec::with_capacity(n);
    for i in 0..n {
        let ch = (b'a' + (i % 26) as u8) as char;
        ops.extend(
            doc.apply_local(&TextEdit::insert(Field::Content, i, ch.to_string()))
                .unwrap(),
        );
    }
    (doc, ops)
}

fn bench_operations_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc_id = Uuid::new_v4();
    let (_, ops) = typed_document(64);

    c.bench_function("operations_encode_64", |b| {
        b.iter(|| {
            let msg = SyncMessage::operations(black_box(peer), black_box(doc_id), black_box(&ops))
                .unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_operations_decode(c: &mut Criterion) {
    let (_, ops) = typed_document(64);
    let encoded = SyncMessage::operations(Uuid::new_v4(), Uuid::new_v4(), &ops)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("operations_decode_64", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.operation_batch().unwrap());
        })
    });
}

fn bench_apply_local_typing(c: &mut Criterion) {
    c.bench_function("apply_local_type_1000_chars", |b| {
        b.iter(|| {
            let (doc, _) = typed_document(black_box(1000));
            black_box(doc.len(Field::Content));
        })
    });
}

fn bench_apply_remote_in_order(c: &mut Criterion) {
    let (_, ops) = typed_document(1000);

    c.bench_function("apply_remote_1000_in_order", |b| {
        b.iter(|| {
            let mut doc = ReplicatedDocument::new();
            black_box(doc.apply_remote(black_box(ops.clone())));
        })
    });
}

fn bench_apply_remote_reversed(c: &mut Criterion) {
    let (_, ops) = typed_document(1000);
    let reversed: Vec<_> = ops.into_iter().rev().collect();

    // Every operation but the last arrives ahead of its anchor.
    c.bench_function("apply_remote_1000_reversed", |b| {
        b.iter(|| {
            let mut doc = ReplicatedDocument::new();
            black_box(doc.apply_remote(black_box(reversed.clone())));
        })
    });
}

fn bench_ops_missing_from(c: &mut Criterion) {
    let (doc, _) = typed_document(1000);
    let (behind, _) = typed_document(10);
    let summary = behind.version_summary();

    c.bench_function("ops_missing_from_1000", |b| {
        b.iter(|| {
            black_box(doc.ops_missing_from(black_box(&summary)));
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let presence = PresenceBroadcast::from(&LocalUser::new(format!("Peer{i}")));
                    receivers.push(group.add_peer(Uuid::new_v4(), presence).await.1);
                }

                let data = Arc::new(vec![0u8; 64]);
                black_box(group.broadcast_raw(black_box(data)));
            });
        })
    });
}

criterion_group!(
    protocol_benches,
    bench_operations_encode,
    bench_operations_decode,
);

criterion_group!(
    crdt_benches,
    bench_apply_local_typing,
    bench_apply_remote_in_order,
    bench_apply_remote_reversed,
    bench_ops_missing_from,
);

criterion_group!(broadcast_benches, bench_broadcast_fan_out);

criterion_main!(protocol_benches, crdt_benches, broadcast_benches);
