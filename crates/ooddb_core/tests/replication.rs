//! Integration tests for replication between two in-process databases.

use ooddb_core::{
    Collision, CollisionResolver, Config, CoreError, Database, DatabaseRegistry, FieldDef,
    FieldKind, HookId, PairingState, PeerPriority, Record, TableDef, TransactionId, Value,
};
use ooddb_protocol::{AuthenticatedBody, Handshake, TransactionIdCorrection};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Peer {
    id: HookId,
    db: Database,
}

fn peer(name: &str) -> Peer {
    let db = Database::open_in_memory(name, Config::default(), &DatabaseRegistry::new()).unwrap();
    db.register_table(
        TableDef::new("note", "notes")
            .field(FieldDef::new("id", FieldKind::Integer).primary_key())
            .field(FieldDef::new("body", FieldKind::Text)),
    )
    .unwrap();
    let id = HookId::generate();
    db.init_local_hook(id).unwrap();
    Peer { id, db }
}

/// A peer that also keeps memos, in their own package.
fn peer_with_memos(name: &str) -> Peer {
    let p = peer(name);
    p.db.register_table(
        TableDef::new("memo", "memos")
            .field(FieldDef::new("id", FieldKind::Integer).primary_key())
            .field(FieldDef::new("body", FieldKind::Text)),
    )
    .unwrap();
    p
}

fn pair_for(a: &Peer, b: &Peer, packages: &[&str]) {
    let packages: BTreeSet<String> = packages.iter().map(|p| p.to_string()).collect();
    a.db.add_hook(b.id, packages.clone()).unwrap();
    b.db.add_hook(a.id, packages).unwrap();
}

fn pair(a: &Peer, b: &Peer) {
    a.db.add_hook(b.id, BTreeSet::new()).unwrap();
    b.db.add_hook(a.id, BTreeSet::new()).unwrap();
}

/// Ships everything `from` holds for `to`; returns the transactions applied.
fn pump(from: &Peer, to: &Peer) -> usize {
    let connected = BTreeSet::from([to.id]);
    let mut applied = 0;
    while let Some(batch) = from.db.export_transactions(to.id, 50, &connected).unwrap() {
        let outcome = to.db.apply_transactions(from.id, &batch).unwrap();
        applied += outcome.applied_transactions;
        from.db
            .validate_last_synchronization(to.id, outcome.last_validated)
            .unwrap();
    }
    applied
}

/// Like [`pump`], returning the gossip produced by the confirmations.
fn pump_with_gossip(from: &Peer, to: &Peer) -> Vec<TransactionIdCorrection> {
    let connected = BTreeSet::from([to.id]);
    let mut gossip = Vec::new();
    while let Some(batch) = from.db.export_transactions(to.id, 50, &connected).unwrap() {
        let outcome = to.db.apply_transactions(from.id, &batch).unwrap();
        let validated = from
            .db
            .validate_last_synchronization(to.id, outcome.last_validated)
            .unwrap();
        gossip.extend(validated.corrections);
    }
    gossip
}

fn settle(a: &Peer, b: &Peer) {
    for _ in 0..8 {
        if pump(a, b) + pump(b, a) == 0 {
            return;
        }
    }
    panic!("peers did not settle");
}

fn note(id: i64, body: &str) -> Record {
    Record::new().with("id", id).with("body", body)
}

fn body(p: &Peer, id: i64) -> Option<Value> {
    p.db.read(|tx| tx.get("note", &[Value::Integer(id)]))
        .unwrap()
        .map(|r| r.value("body"))
}

#[test]
fn local_writes_reach_the_peer() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    a.db.write(|tx| tx.insert("note", &note(1, "hello"))).unwrap();
    a.db.write(|tx| tx.update("note", &note(1, "hello again"))).unwrap();
    b.db.write(|tx| tx.insert("note", &note(2, "from b"))).unwrap();

    settle(&a, &b);
    assert_eq!(body(&b, 1), Some(Value::Text("hello again".into())));
    assert_eq!(body(&a, 2), Some(Value::Text("from b".into())));

    // Confirmed entries are pruned on both sides.
    assert!(a.db.logged_transactions().unwrap().is_empty());
    assert!(b.db.logged_transactions().unwrap().is_empty());
    assert_eq!(
        a.db.hook(b.id).unwrap().unwrap().last_validated_local_transaction_id,
        TransactionId::new(2)
    );
}

#[test]
fn deletes_replicate() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    a.db.write(|tx| tx.insert("note", &note(1, "temporary"))).unwrap();
    settle(&a, &b);
    b.db.write(|tx| tx.delete("note", &[Value::Integer(1)])).unwrap();
    settle(&a, &b);
    assert_eq!(body(&a, 1), None);
}

#[test]
fn redelivered_batches_are_skipped() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    a.db.write(|tx| tx.insert("note", &note(1, "once"))).unwrap();

    let connected = BTreeSet::from([b.id]);
    let batch = a.db.export_transactions(b.id, 50, &connected).unwrap().unwrap();
    let first = b.db.apply_transactions(a.id, &batch).unwrap();
    let second = b.db.apply_transactions(a.id, &batch).unwrap();
    assert_eq!(first.applied_transactions, 1);
    assert_eq!(second.applied_transactions, 0);
    assert_eq!(second.skipped_transactions, 1);
    assert_eq!(second.last_validated, first.last_validated);
}

#[test]
fn existing_rows_are_seeded_on_pairing() {
    let (a, b) = (peer("a"), peer("b"));
    a.db.write(|tx| tx.insert("note", &note(1, "a's"))).unwrap();
    b.db.write(|tx| tx.insert("note", &note(2, "b's"))).unwrap();
    pair(&a, &b);
    settle(&a, &b);
    assert_eq!(body(&a, 2), Some(Value::Text("b's".into())));
    assert_eq!(body(&b, 1), Some(Value::Text("a's".into())));
}

/// Counts resolver calls and defers to [`PeerPriority`].
#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

impl CollisionResolver for Counting {
    fn direct_collision_detected(&self, collision: &Collision<'_>) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        PeerPriority.direct_collision_detected(collision)
    }

    fn indirect_collision_detected(&self, collision: &Collision<'_>, third_peer: HookId) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        PeerPriority.indirect_collision_detected(collision, third_peer)
    }
}

#[test]
fn concurrent_updates_converge_with_one_call_per_peer() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    let on_a = Arc::new(Counting::default());
    let on_b = Arc::new(Counting::default());
    a.db.set_collision_resolver(on_a.clone());
    b.db.set_collision_resolver(on_b.clone());

    a.db.write(|tx| tx.insert("note", &note(1, "draft"))).unwrap();
    settle(&a, &b);

    a.db.write(|tx| tx.update("note", &note(1, "edited on a"))).unwrap();
    b.db.write(|tx| tx.update("note", &note(1, "edited on b"))).unwrap();
    settle(&a, &b);

    assert_eq!(on_a.calls.load(Ordering::SeqCst), 1);
    assert_eq!(on_b.calls.load(Ordering::SeqCst), 1);
    let winner = if a.id > b.id { "edited on a" } else { "edited on b" };
    assert_eq!(body(&a, 1), Some(Value::Text(winner.into())));
    assert_eq!(body(&b, 1), Some(Value::Text(winner.into())));
}

#[test]
fn sequential_updates_do_not_collide() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    let on_b = Arc::new(Counting::default());
    b.db.set_collision_resolver(on_b.clone());

    b.db.write(|tx| tx.insert("note", &note(1, "v1"))).unwrap();
    settle(&a, &b);
    a.db.write(|tx| tx.update("note", &note(1, "v2"))).unwrap();
    settle(&a, &b);
    assert_eq!(on_b.calls.load(Ordering::SeqCst), 0);
    assert_eq!(body(&b, 1), Some(Value::Text("v2".into())));
}

#[test]
fn confirmations_never_move_backwards() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    a.db.write(|tx| tx.insert("note", &note(1, "x"))).unwrap();
    settle(&a, &b);
    let result = a.db.validate_last_synchronization(b.id, TransactionId::ZERO);
    assert!(matches!(result, Err(CoreError::CursorRegression { .. })));
}

#[test]
fn strangers_are_refused() {
    let a = peer("a");
    let stranger = HookId::generate();
    let result = a.db.export_transactions(stranger, 10, &BTreeSet::new());
    assert!(matches!(result, Err(CoreError::UnknownPeer(id)) if id == stranger));
}

#[test]
fn handshake_completes_pairing_and_reports_positions() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    assert_eq!(
        a.db.hook(b.id).unwrap().unwrap().pairing_state,
        PairingState::P2PPairingInProgress
    );
    a.db.write(|tx| tx.insert("note", &note(1, "x"))).unwrap();
    pump(&a, &b);

    let from_b = b.db.handshake_for(a.id).unwrap();
    assert_eq!(from_b.last_validated_distant, TransactionId::new(1));
    let hook = a.db.handle_handshake(b.id, &from_b).unwrap();
    assert_eq!(hook.pairing_state, PairingState::Paired);
    assert_eq!(hook.last_validated_local_transaction_id, TransactionId::new(1));

    let restored = Handshake {
        last_validated_distant: TransactionId::ZERO,
        packages: BTreeSet::new(),
    };
    let hook = a.db.handle_handshake(b.id, &restored).unwrap();
    assert_eq!(hook.last_validated_local_transaction_id, TransactionId::ZERO);
}

#[test]
fn removal_notice_unpairs_both_sides() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    a.db.write(|tx| tx.insert("note", &note(1, "x"))).unwrap();

    assert_eq!(a.db.remove_hook_with_notice(b.id).unwrap(), 1);
    let queued = a.db.pending_messages(b.id).unwrap();
    assert!(matches!(
        queued.last().map(|m| &m.body),
        Some(AuthenticatedBody::HookRemoveRequest { removed }) if *removed == b.id
    ));

    for message in queued {
        b.db.apply_authenticated(a.id, &message.body).unwrap();
        a.db.message_sent(b.id, message.message_id).unwrap();
    }
    assert_eq!(
        a.db.hook(b.id).unwrap().unwrap().pairing_state,
        PairingState::Removed
    );
    assert_eq!(
        b.db.hook(a.id).unwrap().unwrap().pairing_state,
        PairingState::Removed
    );
    assert!(a.db.logged_transactions().unwrap().is_empty());
    assert!(a.db.pending_messages(b.id).unwrap().is_empty());
}

#[test]
fn package_announcement_completes_pairing() {
    let (a, b) = (peer("a"), peer("b"));
    pair(&a, &b);
    let announcement = a.db.pending_messages(b.id).unwrap().remove(0);
    assert!(matches!(
        announcement.body,
        AuthenticatedBody::HookSynchronizeRequest { .. }
    ));
    b.db.apply_authenticated(a.id, &announcement.body).unwrap();
    assert_eq!(
        b.db.hook(a.id).unwrap().unwrap().pairing_state,
        PairingState::Paired
    );
}

#[test]
fn relayed_transaction_does_not_hide_earlier_ones_of_its_origin() {
    let (a, b, c) = (
        peer_with_memos("a"),
        peer_with_memos("b"),
        peer_with_memos("c"),
    );
    pair_for(&a, &b, &["notes"]);
    pair_for(&b, &c, &["notes"]);
    pair_for(&a, &c, &[]);

    a.db.write(|tx| tx.insert("memo", &note(1, "memo"))).unwrap();
    a.db.write(|tx| tx.insert("note", &note(1, "note"))).unwrap();

    pump(&a, &b);
    let gossip = pump_with_gossip(&b, &c);
    assert_eq!(gossip.len(), 1);
    assert_eq!(gossip[0].origin, a.id);
    for correction in &gossip {
        a.db.apply_correction(b.id, correction).unwrap();
    }
    // c holds the note, not the memo logged before it.
    let memo_entry = TransactionId::new(1);
    assert!(a.db.logged_transactions().unwrap().iter().any(|t| t.id == memo_entry));
    assert_eq!(
        a.db.hook(c.id).unwrap().unwrap().last_validated_local_transaction_id,
        TransactionId::ZERO
    );

    let handshake = c.db.handshake_for(a.id).unwrap();
    assert_eq!(handshake.last_validated_distant, TransactionId::ZERO);

    pump(&a, &c);
    let memo = c
        .db
        .read(|tx| tx.get("memo", &[Value::Integer(1)]))
        .unwrap()
        .map(|r| r.value("body"));
    assert_eq!(memo, Some(Value::Text("memo".into())));
    assert_eq!(body(&c, 1), Some(Value::Text("note".into())));
    assert!(a.db.logged_transactions().unwrap().is_empty());
}

#[test]
fn edits_of_relayed_rows_do_not_collide() {
    let (a, b, c) = (peer("a"), peer("b"), peer("c"));
    pair(&a, &b);
    pair(&b, &c);
    pair(&a, &c);
    let on_a = Arc::new(Counting::default());
    let on_b = Arc::new(Counting::default());
    a.db.set_collision_resolver(on_a.clone());
    b.db.set_collision_resolver(on_b.clone());

    // a and c only ever talk through b.
    a.db.write(|tx| tx.insert("note", &note(1, "from a"))).unwrap();
    pump(&a, &b);
    pump(&b, &c);
    assert_eq!(body(&c, 1), Some(Value::Text("from a".into())));

    c.db.write(|tx| tx.update("note", &note(1, "edited on c"))).unwrap();
    pump(&c, &b);
    pump(&b, &a);

    assert_eq!(on_a.calls.load(Ordering::SeqCst), 0);
    assert_eq!(on_b.calls.load(Ordering::SeqCst), 0);
    assert_eq!(body(&a, 1), Some(Value::Text("edited on c".into())));
}
