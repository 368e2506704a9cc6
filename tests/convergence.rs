//! Convergence properties across the five data types: any delivery order,
//! any permutation, arbitrary duplication — identical observable state.

use serde_json::json;

use synckit::crdt::test_util::{assert_order_free, twins, TestReplica};
use synckit::crdt::{CrdtKind, DeltaPayload, DocumentState};
use synckit::ClientId;

fn lww_write(replica: &mut TestReplica, field: &str, value: serde_json::Value) -> DeltaPayload {
    let stamp = replica.stamp();
    replica.tick();
    match &mut replica.state {
        DocumentState::Document(map) => DeltaPayload::Fields {
            writes: vec![map.set(field, value, stamp)],
        },
        _ => unreachable!(),
    }
}

fn text_insert(replica: &mut TestReplica, index: usize, content: &str) -> DeltaPayload {
    let mut first = 0;
    for i in 0..content.chars().count() {
        let seq = replica.tick();
        if i == 0 {
            first = seq;
        }
    }
    let client = replica.client;
    match &mut replica.state {
        DocumentState::Text(text) => DeltaPayload::Text {
            ops: text.insert(index, content, client, first),
        },
        _ => unreachable!(),
    }
}

fn visible_text(replica: &TestReplica) -> String {
    match &replica.state {
        DocumentState::Text(text) => text.text(),
        _ => unreachable!(),
    }
}

#[test_log::test]
fn lww_tie_break_prefers_greater_client_everywhere() {
    // Both replicas write the same field at the same wall millisecond.
    let (mut a, mut b) = twins(CrdtKind::Document);
    a.set_now(1_000);
    b.set_now(1_000);

    let write_a = lww_write(&mut a, "title", json!("V1"));
    let write_b = lww_write(&mut b, "title", json!("V2"));

    a.apply(&write_b);
    b.apply(&write_a);

    for replica in [&a, &b] {
        match &replica.state {
            DocumentState::Document(map) => {
                assert_eq!(map.get("title"), Some(&json!("V2")));
            }
            _ => unreachable!(),
        }
    }
    assert_order_free(CrdtKind::Document, &[write_a, write_b]);
}

#[test_log::test]
fn lww_mixed_fields_converge_under_any_order() {
    let (mut a, mut b) = twins(CrdtKind::Document);
    a.set_now(1_000);
    b.set_now(2_000);
    let payloads = vec![
        lww_write(&mut a, "title", json!("draft")),
        lww_write(&mut b, "title", json!("final")),
        lww_write(&mut a, "tags", json!(["sync"])),
        {
            // deletion is a tombstone write
            let stamp = b.stamp();
            b.tick();
            match &mut b.state {
                DocumentState::Document(map) => DeltaPayload::Fields {
                    writes: vec![map.delete("tags", stamp)],
                },
                _ => unreachable!(),
            }
        },
    ];
    assert_order_free(CrdtKind::Document, &payloads);
}

#[test_log::test]
fn concurrent_text_runs_stay_contiguous() {
    let (mut a, mut b) = twins(CrdtKind::Text);

    let hello = text_insert(&mut a, 0, "hello");
    let world = text_insert(&mut b, 0, "world");

    a.apply(&world);
    b.apply(&hello);

    let text = visible_text(&a);
    assert_eq!(text, visible_text(&b));
    // Deterministic winner, and never a character-interleaved shuffle.
    assert_eq!(text, "worldhello");
    assert_order_free(CrdtKind::Text, &[hello, world]);
}

#[test_log::test]
fn text_insert_delete_converges_with_duplication() {
    let (mut a, mut b) = twins(CrdtKind::Text);
    let seed = text_insert(&mut a, 0, "abcd");
    b.apply(&seed);

    let del = {
        a.tick();
        match &mut a.state {
            DocumentState::Text(text) => DeltaPayload::Text {
                ops: text.delete(1, 2),
            },
            _ => unreachable!(),
        }
    };
    let ins = text_insert(&mut b, 4, "!");

    a.apply(&ins);
    b.apply(&del);
    // Re-deliver everything once more.
    for payload in [&seed, &del, &ins] {
        a.apply(payload);
        b.apply(payload);
    }

    assert_eq!(visible_text(&a), "ad!");
    assert_eq!(visible_text(&a), visible_text(&b));
}

#[test_log::test]
fn rich_text_overlapping_formats_converge() {
    let (mut a, mut b) = twins(CrdtKind::RichText);
    a.set_now(1_000);
    b.set_now(1_000);

    let seed = {
        let mut first = 0;
        for i in 0..10 {
            let seq = a.tick();
            if i == 0 {
                first = seq;
            }
        }
        let client = a.client;
        match &mut a.state {
            DocumentState::RichText(rich) => DeltaPayload::RichText {
                ops: rich.insert(0, "abcdefghij", client, first),
            },
            _ => unreachable!(),
        }
    };
    b.apply(&seed);

    let bold = {
        let stamp = a.stamp();
        let id = a.next_op_id();
        match &mut a.state {
            DocumentState::RichText(rich) => DeltaPayload::RichText {
                ops: rich.format(0, 5, "bold", json!(true), id, stamp),
            },
            _ => unreachable!(),
        }
    };
    let italic = {
        let stamp = b.stamp();
        let id = b.next_op_id();
        match &mut b.state {
            DocumentState::RichText(rich) => DeltaPayload::RichText {
                ops: rich.format(3, 8, "italic", json!(true), id, stamp),
            },
            _ => unreachable!(),
        }
    };

    a.apply(&italic);
    b.apply(&bold);

    for replica in [&a, &b] {
        match &replica.state {
            DocumentState::RichText(rich) => {
                let runs = rich.runs();
                assert_eq!(runs[0].0, "abc");
                assert!(runs[0].1.contains_key("bold") && !runs[0].1.contains_key("italic"));
                assert_eq!(runs[1].0, "de");
                assert!(runs[1].1.contains_key("bold") && runs[1].1.contains_key("italic"));
                assert_eq!(runs[2].0, "fgh");
                assert!(!runs[2].1.contains_key("bold") && runs[2].1.contains_key("italic"));
            }
            _ => unreachable!(),
        }
    }
    assert_order_free(CrdtKind::RichText, &[seed, bold, italic]);
}

#[test_log::test]
fn counter_sums_distributed_increments() {
    let (mut a, mut b) = twins(CrdtKind::Counter);
    let mut payloads = Vec::new();
    for _ in 0..2 {
        a.tick();
        match &mut a.state {
            DocumentState::Counter(counter) => payloads.push(DeltaPayload::Counter {
                delta: counter.increment(a.client, 1),
            }),
            _ => unreachable!(),
        }
    }
    for _ in 0..3 {
        b.tick();
        match &mut b.state {
            DocumentState::Counter(counter) => payloads.push(DeltaPayload::Counter {
                delta: counter.increment(b.client, 1),
            }),
            _ => unreachable!(),
        }
    }

    for payload in &payloads {
        a.apply(payload);
        b.apply(payload);
    }
    for replica in [&a, &b] {
        match &replica.state {
            DocumentState::Counter(counter) => assert_eq!(counter.value(), 5),
            _ => unreachable!(),
        }
    }
    assert_order_free(CrdtKind::Counter, &payloads);
}

#[test_log::test]
fn or_set_add_wins_against_unseen_remove() {
    let (mut a, mut b) = twins(CrdtKind::Set);

    let add = {
        let tag = a.next_op_id();
        match &mut a.state {
            DocumentState::Set(set) => DeltaPayload::Set {
                delta: set.add("x", tag),
            },
            _ => unreachable!(),
        }
    };
    // B removes without ever observing A's add.
    let remove = {
        b.tick();
        match &mut b.state {
            DocumentState::Set(set) => DeltaPayload::Set {
                delta: set.remove("x"),
            },
            _ => unreachable!(),
        }
    };

    a.apply(&remove);
    b.apply(&add);

    for replica in [&a, &b] {
        match &replica.state {
            DocumentState::Set(set) => assert!(set.contains("x")),
            _ => unreachable!(),
        }
    }
    assert_order_free(CrdtKind::Set, &[add, remove]);
}

#[test_log::test]
fn three_way_text_insert_is_total_and_deterministic() {
    let mut a = TestReplica::new(CrdtKind::Text, 1);
    let mut b = TestReplica::new(CrdtKind::Text, 2);
    let mut c = TestReplica::new(CrdtKind::Text, 3);

    let pa = text_insert(&mut a, 0, "aa");
    let pb = text_insert(&mut b, 0, "bb");
    let pc = text_insert(&mut c, 0, "cc");

    assert_order_free(CrdtKind::Text, &[pa, pb, pc]);
}

#[test_log::test]
fn idempotence_holds_for_every_kind() {
    // One representative payload per kind, applied twice against once.
    let client = ClientId::new(9);

    let mut lww = TestReplica::new(CrdtKind::Document, 9);
    let fields = lww_write(&mut lww, "k", json!(1));

    let mut text = TestReplica::new(CrdtKind::Text, 9);
    let text_payload = text_insert(&mut text, 0, "hi");

    let counter_payload = {
        let mut replica = TestReplica::new(CrdtKind::Counter, 9);
        replica.tick();
        match &mut replica.state {
            DocumentState::Counter(counter) => DeltaPayload::Counter {
                delta: counter.increment(client, 4),
            },
            _ => unreachable!(),
        }
    };
    let set_payload = {
        let mut replica = TestReplica::new(CrdtKind::Set, 9);
        let tag = replica.next_op_id();
        match &mut replica.state {
            DocumentState::Set(set) => DeltaPayload::Set {
                delta: set.add("x", tag),
            },
            _ => unreachable!(),
        }
    };

    for (kind, payload) in [
        (CrdtKind::Document, fields),
        (CrdtKind::Text, text_payload),
        (CrdtKind::Counter, counter_payload),
        (CrdtKind::Set, set_payload),
    ] {
        let mut once = DocumentState::new(kind);
        once.apply(&"d".to_string(), &payload).unwrap();
        let mut twice = DocumentState::new(kind);
        twice.apply(&"d".to_string(), &payload).unwrap();
        assert!(!twice.apply(&"d".to_string(), &payload).unwrap());
        assert_eq!(once, twice);
    }
}

#[test_log::test]
fn lww_writes_from_one_batch_merge_independently() {
    // Two fields written under one shared stamp; a later single-field write
    // overrides only its own field.
    let (mut a, mut b) = twins(CrdtKind::Document);
    a.set_now(1_000);
    b.set_now(2_000);

    let batch = {
        let stamp = a.stamp();
        a.tick();
        match &mut a.state {
            DocumentState::Document(map) => {
                let writes =
                    map.set_many(vec![("x".into(), json!(1)), ("y".into(), json!(1))], stamp);
                assert_eq!(writes[0].stamp, writes[1].stamp);
                DeltaPayload::Fields { writes }
            }
            _ => unreachable!(),
        }
    };
    let override_y = lww_write(&mut b, "y", json!(2));

    a.apply(&override_y);
    b.apply(&batch);

    for replica in [&a, &b] {
        match &replica.state {
            DocumentState::Document(map) => {
                assert_eq!(map.get("x"), Some(&json!(1)));
                assert_eq!(map.get("y"), Some(&json!(2)));
            }
            _ => unreachable!(),
        }
    }
}
