use collabboard_sync::broadcast::{BroadcastGroup, Envelope};
use collabboard_sync::document::{Document, DocumentState};
use collabboard_sync::operation::Mutation;
use collabboard_sync::persistence::{Snapshot, SnapshotStore};
use collabboard_sync::presence::{Cursor, PresenceRecord, Roster, UserInfo};
use collabboard_sync::protocol::SyncMessage;
use collabboard_sync::record::Fields;
use collabboard_sync::session::Outbox;
use collabboard_sync::storage::{DocumentStore, StoreConfig};
use collabboard_sync::ReplicaId;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn shape_fields(i: u64) -> Fields {
    [
        ("x".to_string(), json!(i as f64 * 10.5)),
        ("y".to_string(), json!(i as f64 * 3.25)),
        ("w".to_string(), json!(120)),
        ("h".to_string(), json!(80)),
        ("fill".to_string(), json!("#4f9dff")),
    ]
    .into_iter()
    .collect()
}

/// A board with `n` shapes, a tenth of them removed.
fn board(n: u64) -> DocumentState {
    let mut doc = Document::new(ReplicaId::new("bench"));
    for i in 0..n {
        doc.local_mutate(Mutation::put(format!("shape-{i}"), "rect", shape_fields(i)))
            .unwrap();
    }
    for i in (0..n).step_by(10) {
        doc.local_mutate(Mutation::remove(format!("shape-{i}"))).unwrap();
    }
    doc.state()
}

// ─── Protocol ────────────────────────────────────────────────────────────────

fn bench_operation_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let mut doc = Document::new(ReplicaId::new("bench"));
    let op = doc
        .local_mutate(Mutation::put("shape-1", "rect", shape_fields(1)))
        .unwrap();

    c.bench_function("operation_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::operation(black_box(peer), black_box("board"), black_box(&op)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let mut doc = Document::new(ReplicaId::new("bench"));
    let op = doc
        .local_mutate(Mutation::put("shape-1", "rect", shape_fields(1)))
        .unwrap();
    let encoded = SyncMessage::operation(Uuid::new_v4(), "board", &op)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("operation_decode", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.operation_payload().unwrap());
        })
    });
}

fn bench_state_encode_1000(c: &mut Criterion) {
    let state = board(1000);
    let peer = Uuid::new_v4();

    c.bench_function("state_encode_1000_records", |b| {
        b.iter(|| {
            let msg = SyncMessage::sync_step2(peer, "board", black_box(&state)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_state_decode_1000(c: &mut Criterion) {
    let encoded = SyncMessage::sync_step2(Uuid::new_v4(), "board", &board(1000))
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("state_decode_1000_records", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.document_state().unwrap());
        })
    });
}

// ─── Document ────────────────────────────────────────────────────────────────

fn bench_local_mutate(c: &mut Criterion) {
    c.bench_function("local_mutate_patch", |b| {
        let mut doc = Document::new(ReplicaId::new("bench"));
        doc.local_mutate(Mutation::put("shape-1", "rect", shape_fields(1)))
            .unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let patch = Mutation::patch("shape-1", [("x".to_string(), json!(i))].into_iter().collect());
            black_box(doc.local_mutate(black_box(patch)).unwrap());
        })
    });
}

fn bench_apply_remote_1000(c: &mut Criterion) {
    let mut source = Document::new(ReplicaId::new("source"));
    let ops: Vec<_> = (0..1000)
        .map(|i| {
            source
                .local_mutate(Mutation::put(format!("shape-{i}"), "rect", shape_fields(i)))
                .unwrap()
        })
        .collect();

    c.bench_function("apply_1000_remote_operations", |b| {
        b.iter(|| {
            let mut doc = Document::new(ReplicaId::new("sink"));
            for op in &ops {
                black_box(doc.apply(black_box(op)).unwrap());
            }
        })
    });
}

fn bench_merge_state_1000(c: &mut Criterion) {
    let left = board(1000);
    let mut right_doc = Document::from_state(ReplicaId::new("right"), left.clone());
    for i in 0..100 {
        right_doc
            .local_mutate(Mutation::patch(format!("shape-{}", i * 7 + 1), shape_fields(i + 5000)))
            .unwrap();
    }
    let right = right_doc.state();

    c.bench_function("merge_state_1000_records", |b| {
        b.iter(|| {
            let mut doc = Document::from_state(ReplicaId::new("left"), left.clone());
            black_box(doc.merge_state(black_box(&right)));
        })
    });
}

// ─── Broadcast ───────────────────────────────────────────────────────────────

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let user = UserInfo::new(format!("user-{i}"), format!("Peer{i}"));
                    receivers.push(group.add_peer(Uuid::new_v4(), user).await);
                }

                let envelope = Envelope {
                    origin: Uuid::nil(),
                    frame: Arc::new(vec![0u8; 64]),
                };
                black_box(group.broadcast_raw(black_box(envelope)));
            });
        })
    });
}

// ─── Session / presence ──────────────────────────────────────────────────────

fn bench_outbox_push_ack(c: &mut Criterion) {
    let mut doc = Document::new(ReplicaId::new("bench"));
    let ops: Vec<_> = (0..1000)
        .map(|i| {
            doc.local_mutate(Mutation::put(format!("shape-{i}"), "rect", Fields::new()))
                .unwrap()
        })
        .collect();

    c.bench_function("outbox_push_ack_1000", |b| {
        b.iter(|| {
            let mut outbox = Outbox::new(10_000);
            for op in &ops {
                outbox.push(op.clone());
            }
            black_box(outbox.ack(black_box(1000)));
        })
    });
}

fn bench_roster_upsert_100(c: &mut Criterion) {
    let records: Vec<PresenceRecord> = (0..100)
        .map(|i| PresenceRecord {
            connection_id: Uuid::new_v4(),
            user: UserInfo::new(format!("user-{i}"), format!("Peer {i}")),
            cursor: Some(Cursor::new(i as f64, i as f64)),
        })
        .collect();

    c.bench_function("roster_upsert_100_peers", |b| {
        b.iter(|| {
            let mut roster = Roster::default();
            for record in &records {
                roster.upsert(black_box(record.clone()));
            }
            black_box(roster.summary(5));
        })
    });
}

// ─── Storage ─────────────────────────────────────────────────────────────────

fn bench_save_snapshot_1000(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let snapshot = Snapshot::new(board(1000));

    c.bench_function("save_snapshot_1000_records", |b| {
        b.iter(|| {
            black_box(store.save_snapshot("board", black_box(&snapshot)).unwrap());
        })
    });
}

fn bench_load_snapshot_1000(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    store
        .save_snapshot("board", &Snapshot::new(board(1000)))
        .unwrap();

    c.bench_function("load_snapshot_1000_records", |b| {
        b.iter(|| {
            black_box(store.load_snapshot(black_box("board")).unwrap());
        })
    });
}

criterion_group!(
    protocol_benches,
    bench_operation_encode,
    bench_operation_decode,
    bench_state_encode_1000,
    bench_state_decode_1000,
);

criterion_group!(
    document_benches,
    bench_local_mutate,
    bench_apply_remote_1000,
    bench_merge_state_1000,
);

criterion_group!(
    runtime_benches,
    bench_broadcast_raw,
    bench_outbox_push_ack,
    bench_roster_upsert_100,
);

criterion_group!(
    storage_benches,
    bench_save_snapshot_1000,
    bench_load_snapshot_1000,
);

criterion_main!(protocol_benches, document_benches, runtime_benches, storage_benches);
