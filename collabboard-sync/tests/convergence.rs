//! Convergence properties of the document CRDT.
//!
//! Verifies:
//! - Any per-replica-FIFO interleaving of the same operations converges
//! - Applying an operation twice changes nothing
//! - Field-level concurrency keeps both patches
//! - Same-field ties resolve to the higher replica id
//! - Tombstones beat equal or older writes, lose to newer ones

use collabboard_sync::clock::{OpId, ReplicaId};
use collabboard_sync::document::{Document, DocumentState};
use collabboard_sync::operation::{Mutation, Operation};
use collabboard_sync::record::Fields;
use proptest::prelude::*;
use serde_json::{json, Value};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn op(replica: &str, seq: u64, version: u64, timestamp: u64, mutation: Mutation) -> Operation {
    Operation {
        id: OpId {
            replica: ReplicaId::new(replica),
            seq,
        },
        version,
        timestamp,
        mutation,
    }
}

fn apply_all(ops: &[Operation]) -> DocumentState {
    let mut doc = Document::new(ReplicaId::new("observer"));
    for op in ops {
        doc.apply(op).unwrap();
    }
    doc.state()
}

/// One step of a simulated editing session.
#[derive(Debug, Clone)]
enum Step {
    Put { replica: usize, record: usize, value: i64 },
    Patch { replica: usize, record: usize, field: usize, value: i64 },
    Remove { replica: usize, record: usize },
    /// `replica` receives everything `from` has produced so far
    Sync { replica: usize, from: usize },
}

const REPLICAS: usize = 3;
const RECORDS: [&str; 3] = ["r0", "r1", "r2"];
const FIELDS: [&str; 3] = ["x", "y", "color"];

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..REPLICAS, 0..RECORDS.len(), -5i64..5)
            .prop_map(|(replica, record, value)| Step::Put { replica, record, value }),
        (0..REPLICAS, 0..RECORDS.len(), 0..FIELDS.len(), -5i64..5).prop_map(
            |(replica, record, field, value)| Step::Patch { replica, record, field, value }
        ),
        (0..REPLICAS, 0..RECORDS.len()).prop_map(|(replica, record)| Step::Remove { replica, record }),
        (0..REPLICAS, 0..REPLICAS).prop_map(|(replica, from)| Step::Sync { replica, from }),
    ]
}

/// Run the steps; returns each replica's own operations in generation order.
fn simulate(steps: &[Step]) -> Vec<Vec<Operation>> {
    let mut docs: Vec<Document> = (0..REPLICAS)
        .map(|i| Document::new(ReplicaId::new(format!("replica-{i}"))))
        .collect();
    let mut streams: Vec<Vec<Operation>> = vec![Vec::new(); REPLICAS];

    for step in steps {
        match step {
            Step::Put { replica, record, value } => {
                let mutation = Mutation::put(RECORDS[*record], "rect", fields(&[("x", json!(value))]));
                let op = docs[*replica].local_mutate(mutation).unwrap();
                streams[*replica].push(op);
            }
            Step::Patch { replica, record, field, value } => {
                let mutation = Mutation::patch(RECORDS[*record], fields(&[(FIELDS[*field], json!(value))]));
                let op = docs[*replica].local_mutate(mutation).unwrap();
                streams[*replica].push(op);
            }
            Step::Remove { replica, record } => {
                let op = docs[*replica].local_mutate(Mutation::remove(RECORDS[*record])).unwrap();
                streams[*replica].push(op);
            }
            Step::Sync { replica, from } => {
                let incoming = streams[*from].clone();
                for op in &incoming {
                    docs[*replica].apply(op).unwrap();
                }
            }
        }
    }
    streams
}

/// Merge the streams, keeping each stream's own order; `picks` chooses
/// which stream goes next and round-robin takes over once it runs out.
fn interleave(streams: &[Vec<Operation>], picks: &[usize]) -> Vec<Operation> {
    let mut cursors = vec![0usize; streams.len()];
    let total: usize = streams.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut picks = picks.iter().copied();
    let mut rr = 0;

    while out.len() < total {
        let preferred = picks.next().unwrap_or_else(|| {
            rr += 1;
            rr
        }) % streams.len();
        let chosen = (0..streams.len())
            .map(|offset| (preferred + offset) % streams.len())
            .find(|&i| cursors[i] < streams[i].len());
        if let Some(i) = chosen {
            out.push(streams[i][cursors[i]].clone());
            cursors[i] += 1;
        }
    }
    out
}

proptest! {
    #[test]
    fn prop_interleavings_converge(
        steps in prop::collection::vec(arb_step(), 1..40),
        picks_a in prop::collection::vec(0..REPLICAS, 0..120),
        picks_b in prop::collection::vec(0..REPLICAS, 0..120),
    ) {
        let streams = simulate(&steps);
        let a = apply_all(&interleave(&streams, &picks_a));
        let b = apply_all(&interleave(&streams, &picks_b));
        prop_assert_eq!(&a, &b);

        // Reverse replica order as a third schedule.
        let mut reversed: Vec<Vec<Operation>> = streams.clone();
        reversed.reverse();
        let c = apply_all(&reversed.concat());
        prop_assert_eq!(&a, &c);
    }

    #[test]
    fn prop_apply_is_idempotent(
        steps in prop::collection::vec(arb_step(), 1..30),
    ) {
        let ops: Vec<Operation> = simulate(&steps).concat();
        let mut doc = Document::new(ReplicaId::new("observer"));
        for op in &ops {
            doc.apply(op).unwrap();
        }
        let once = doc.state();
        for op in &ops {
            prop_assert!(doc.apply(op).unwrap().is_empty());
        }
        prop_assert_eq!(once, doc.state());
    }

    #[test]
    fn prop_state_merge_commutes(
        steps in prop::collection::vec(arb_step(), 1..30),
    ) {
        let streams = simulate(&steps);
        let left = apply_all(&streams[0]);
        let right = apply_all(&[streams[1].clone(), streams[2].clone()].concat());

        let mut ab = Document::from_state(ReplicaId::new("ab"), left.clone());
        ab.merge_state(&right);
        let mut ba = Document::from_state(ReplicaId::new("ba"), right.clone());
        ba.merge_state(&left);

        prop_assert_eq!(ab.state(), ba.state());
        prop_assert_eq!(ab.state(), apply_all(&streams.concat()));

        // Merging again is a no-op.
        prop_assert!(ab.merge_state(&right).is_empty());
    }
}

#[test]
fn test_field_level_concurrency() {
    let mut seed = Document::new(ReplicaId::new("seed"));
    seed.local_mutate(Mutation::put("r1", "rect", fields(&[("x", json!(0)), ("y", json!(0))])))
        .unwrap();

    let mut a = Document::from_state(ReplicaId::new("A"), seed.state());
    let mut b = Document::from_state(ReplicaId::new("B"), seed.state());
    let op_a = a.local_mutate(Mutation::patch("r1", fields(&[("x", json!(5))]))).unwrap();
    let op_b = b.local_mutate(Mutation::patch("r1", fields(&[("y", json!(9))]))).unwrap();

    a.apply(&op_b).unwrap();
    b.apply(&op_a).unwrap();

    let expected = fields(&[("x", json!(5)), ("y", json!(9))]);
    assert_eq!(a.get("r1").unwrap().fields, expected);
    assert_eq!(b.get("r1").unwrap().fields, expected);
    assert_eq!(a.state(), b.state());
}

#[test]
fn test_same_field_tie_breaks_on_replica_id() {
    let mut seed = Document::new(ReplicaId::new("seed"));
    seed.local_mutate(Mutation::put("r1", "rect", Fields::new())).unwrap();

    let mut a = Document::from_state(ReplicaId::new("A"), seed.state());
    let mut b = Document::from_state(ReplicaId::new("B"), seed.state());
    let op_a = a
        .local_mutate(Mutation::patch("r1", fields(&[("color", json!("red"))])))
        .unwrap();
    let op_b = b
        .local_mutate(Mutation::patch("r1", fields(&[("color", json!("blue"))])))
        .unwrap();
    assert_eq!((op_a.version, op_a.timestamp), (op_b.version, op_b.timestamp));

    a.apply(&op_b).unwrap();
    b.apply(&op_a).unwrap();

    assert_eq!(a.get("r1").unwrap().fields["color"], json!("blue"));
    assert_eq!(b.get("r1").unwrap().fields["color"], json!("blue"));
    assert_eq!(a.get("r1").unwrap().last_writer, ReplicaId::new("B"));
}

#[test]
fn test_tombstone_beats_older_patch() {
    let put = op("a", 1, 1, 1, Mutation::put("r1", "rect", fields(&[("x", json!(1))])));
    let remove = op("a", 2, 1, 5, Mutation::remove("r1"));
    let stale = op("b", 1, 1, 4, Mutation::patch("r1", fields(&[("y", json!(2))])));

    // Either delivery order leaves the record absent.
    for ops in [
        vec![put.clone(), remove.clone(), stale.clone()],
        vec![stale.clone(), put.clone(), remove.clone()],
    ] {
        let mut doc = Document::new(ReplicaId::new("observer"));
        for op in &ops {
            doc.apply(op).unwrap();
        }
        assert!(doc.get("r1").is_none());
    }
}

#[test]
fn test_tombstone_beats_equal_clock() {
    let remove = op("b", 1, 1, 5, Mutation::remove("r1"));
    let patch = op("a", 1, 1, 5, Mutation::patch("r1", fields(&[("y", json!(2))])));

    let mut doc = Document::new(ReplicaId::new("observer"));
    doc.apply(&remove).unwrap();
    doc.apply(&patch).unwrap();
    assert!(doc.get("r1").is_none());
}

#[test]
fn test_newer_patch_resurrects_with_only_its_fields() {
    let put = op("a", 1, 1, 1, Mutation::put("r1", "rect", fields(&[("x", json!(1)), ("y", json!(2))])));
    let remove = op("a", 2, 1, 5, Mutation::remove("r1"));
    let patch = op("b", 1, 1, 6, Mutation::patch("r1", fields(&[("y", json!(9))])));

    let in_order = apply_all(&[put.clone(), remove.clone(), patch.clone()]);
    let shuffled = apply_all(&[patch, put, remove]);
    assert_eq!(in_order, shuffled);

    let mut doc = Document::from_state(ReplicaId::new("observer"), in_order);
    let record = doc.get("r1").unwrap();
    assert_eq!(record.fields, fields(&[("y", json!(9))]));
    assert_eq!(record.kind, "rect");

    // And it can be removed again.
    doc.apply(&op("c", 1, 1, 7, Mutation::remove("r1"))).unwrap();
    assert!(doc.get("r1").is_none());
}
