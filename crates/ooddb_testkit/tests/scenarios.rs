//! End-to-end replication scenarios over the loopback mesh.

use ooddb_core::{
    Collision, CollisionResolver, Config, HookId, PairingState, PeerPriority, TransactionId,
};
use ooddb_sync::SyncConfig;
use ooddb_testkit::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

impl Counting {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
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

fn put(id: i64, body: &str) -> NoteOp {
    NoteOp::Put {
        id,
        body: body.into(),
    }
}

#[test]
fn concurrent_offline_updates_converge() {
    let mesh = Mesh::new(2);
    mesh.connect(0, 1);
    mesh.settle();
    mesh.apply(0, &put(1, "original"));
    mesh.settle();
    assert!(mesh.converged());

    let resolvers: Vec<Arc<Counting>> = (0..2).map(|_| Arc::new(Counting::default())).collect();
    for (i, resolver) in resolvers.iter().enumerate() {
        mesh.node(i).db().set_collision_resolver(resolver.clone());
    }

    mesh.disconnect(0, 1);
    mesh.apply(0, &put(1, "edited on 0"));
    mesh.apply(1, &put(1, "edited on 1"));
    mesh.connect(0, 1);
    mesh.settle();

    assert!(mesh.converged());
    assert_eq!(resolvers[0].calls(), 1);
    assert_eq!(resolvers[1].calls(), 1);

    let winner = if mesh.node(0).id > mesh.node(1).id {
        "edited on 0"
    } else {
        "edited on 1"
    };
    assert_eq!(mesh.notes(0).get(&1).map(String::as_str), Some(winner));
}

#[test]
fn relay_advances_cursor_of_the_far_end() {
    // 0 - 1 - 2, with no link between 0 and 2.
    let mesh = Mesh::new(3);
    mesh.connect(0, 1);
    mesh.connect(1, 2);
    mesh.settle();

    mesh.apply(0, &put(1, "relayed"));
    let produced = mesh.last_transaction_id(0);
    mesh.settle();

    assert_eq!(mesh.notes(2).get(&1).map(String::as_str), Some("relayed"));
    assert!(mesh.converged());

    let (origin, far) = (mesh.node(0), mesh.node(2));
    assert_eq!(
        origin.db().transaction_cursor(origin.id, far.id).unwrap(),
        produced.as_u64()
    );
    let far_hook = origin.db().hook(far.id).unwrap().unwrap();
    assert_eq!(far_hook.last_validated_local_transaction_id, produced);
    assert!(origin.db().logged_transactions().unwrap().is_empty());
}

#[test]
fn spilled_transactions_replicate_like_buffered_ones() {
    fn run(threshold: usize) -> Vec<std::collections::BTreeMap<i64, String>> {
        let config = Config::default().max_events_in_memory(threshold);
        let mesh = Mesh::with_config(2, config, SyncConfig::default());
        mesh.connect(0, 1);
        mesh.settle();

        let db = mesh.node(0).db();
        db.write(|tx| {
            for id in 1..=6_000 {
                tx.insert("note", &note(id, "first"))?;
            }
            Ok(())
        })
        .unwrap();
        db.write(|tx| {
            for id in 1..=2_000 {
                tx.update("note", &note(id, "second"))?;
            }
            for id in 4_001..=6_000 {
                tx.delete("note", &[ooddb_core::Value::Integer(id)])?;
            }
            Ok(())
        })
        .unwrap();
        mesh.settle();
        vec![mesh.notes(0), mesh.notes(1)]
    }

    let spilled = run(100);
    let buffered = run(1_000_000);
    assert_eq!(spilled[0].len(), 4_000);
    assert_eq!(spilled[0], spilled[1]);
    assert_eq!(spilled, buffered);
    assert_eq!(spilled[1].get(&1).map(String::as_str), Some("second"));
    assert_eq!(spilled[1].get(&3_000).map(String::as_str), Some("first"));
}

#[test]
fn unpairing_mid_transfer_starts_over_clean() {
    let mesh = Mesh::with_config(2, Config::default(), SyncConfig::default().with_max_events(5));
    mesh.connect(0, 1);
    mesh.settle();
    let (a, b) = (mesh.node(0), mesh.node(1));

    for id in 1..=50 {
        mesh.apply(0, &put(id, "batch"));
    }
    // One batch goes out; the peer is dropped before it lands.
    assert_eq!(a.sync.pump(&a.transport).unwrap(), 1);
    assert!(a.sync.dispatcher().peer_link(b.id).unwrap().transfer_in_progress());

    a.sync.remove_hook(b.id).unwrap();
    assert!(a.sync.dispatcher().is_empty());
    assert_eq!(a.sync.dispatcher().peer_link(b.id), None);
    assert!(a.db().logged_transactions().unwrap().is_empty());
    let removed = a.db().hook(b.id).unwrap().unwrap();
    assert_eq!(removed.pairing_state, PairingState::Removed);
    assert_eq!(removed.last_validated_local_transaction_id, TransactionId::ZERO);
    assert_eq!(a.db().transaction_cursor(a.id, b.id).unwrap(), 0);

    mesh.network().unlink(a.id, b.id);
    b.sync.peer_disconnected(a.id);
    assert!(mesh.notes(1).is_empty());

    a.sync.pair(b.id, BTreeSet::new()).unwrap();
    mesh.connect(0, 1);
    mesh.settle();

    assert_eq!(
        a.db().hook(b.id).unwrap().unwrap().pairing_state,
        PairingState::Paired
    );
    assert_eq!(mesh.notes(1).len(), 50);
    assert!(mesh.converged());
}
