//! In-process mesh of synchronized databases.
//!
//! Every node is a database with its own [`Synchronizer`]; nodes talk over
//! a shared [`LoopbackNetwork`]. [`Mesh::settle`] pumps queues and delivers
//! frames until nothing moves, so tests observe the quiescent state.

use crate::fixtures::{notes, notes_table};
use crate::generators::NoteOp;
use ooddb_core::{Config, Database, DatabaseRegistry, HookId, PairingState, TransactionId};
use ooddb_protocol::{HmacSha256Signer, MessageSigner};
use ooddb_sync::{LoopbackNetwork, LoopbackTransport, SyncConfig, SyncResult, Synchronizer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Upper bound on pump-and-deliver rounds before [`Mesh::settle`] gives up.
const MAX_ROUNDS: usize = 100_000;

/// One database of a [`Mesh`].
pub struct MeshNode {
    /// Local hook id.
    pub id: HookId,
    /// Replication endpoint.
    pub sync: Arc<Synchronizer>,
    /// Sending end on the mesh network.
    pub transport: LoopbackTransport,
}

impl MeshNode {
    /// The node's database.
    pub fn db(&self) -> &Arc<Database> {
        self.sync.database()
    }
}

/// A set of nodes sharing one loopback network.
pub struct Mesh {
    network: Arc<LoopbackNetwork>,
    nodes: Vec<MeshNode>,
}

impl Mesh {
    /// Creates `count` nodes with default settings, each knowing every
    /// other as a paired peer.
    pub fn new(count: usize) -> Self {
        Self::with_config(count, Config::default(), SyncConfig::default())
    }

    /// Creates `count` nodes with the given settings.
    ///
    /// Every node registers every other node, as a central pairing server
    /// would, so no link needs to exist for the pairing to be complete.
    pub fn with_config(count: usize, config: Config, sync_config: SyncConfig) -> Self {
        let network = LoopbackNetwork::new();
        let signer: Arc<dyn MessageSigner> =
            Arc::new(HmacSha256Signer::new("mesh", b"mesh secret".to_vec()));
        let mut nodes = Vec::with_capacity(count);
        for index in 0..count {
            let db = Database::open_in_memory(
                &format!("node-{index}"),
                config.clone(),
                &DatabaseRegistry::new(),
            )
            .expect("Failed to open node database");
            db.register_table(notes_table())
                .expect("Failed to declare notes");
            let id = HookId::generate();
            db.init_local_hook(id).expect("Failed to init local hook");
            let sync = Synchronizer::new(Arc::new(db), sync_config.clone(), Arc::clone(&signer))
                .expect("Failed to create synchronizer");
            nodes.push(MeshNode {
                id,
                sync: Arc::new(sync),
                transport: network.transport(id),
            });
        }
        let mesh = Self { network, nodes };
        mesh.register_everyone();
        mesh
    }

    fn register_everyone(&self) {
        for node in &self.nodes {
            let others: BTreeMap<HookId, BTreeSet<String>> = self
                .nodes
                .iter()
                .filter(|other| other.id != node.id)
                .map(|other| (other.id, BTreeSet::new()))
                .collect();
            node.db()
                .add_hooks(&others, None)
                .expect("Failed to register peers");
            for peer in others.keys() {
                node.db()
                    .set_pairing_state(*peer, PairingState::Paired)
                    .expect("Failed to mark peer paired");
            }
        }
    }

    /// The network.
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }

    /// Node `index`.
    pub fn node(&self, index: usize) -> &MeshNode {
        &self.nodes[index]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true for a mesh without nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Brings the link between nodes `a` and `b` up.
    pub fn connect(&self, a: usize, b: usize) {
        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        self.network.link(na.id, nb.id);
        na.sync.peer_connected(nb.id).expect("Failed to connect");
        nb.sync.peer_connected(na.id).expect("Failed to connect");
    }

    /// Takes the link between nodes `a` and `b` down, losing what was in
    /// flight.
    pub fn disconnect(&self, a: usize, b: usize) {
        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        self.network.unlink(na.id, nb.id);
        na.sync.peer_disconnected(nb.id);
        nb.sync.peer_disconnected(na.id);
    }

    /// Applies `op` on node `index`.
    pub fn apply(&self, index: usize, op: &NoteOp) {
        op.apply(self.nodes[index].db()).expect("Failed to apply op");
    }

    /// Sends everything queued on every node once and delivers every frame
    /// in flight. Returns how many envelopes moved.
    pub fn step(&self) -> SyncResult<usize> {
        let mut moved = 0;
        for node in &self.nodes {
            moved += node.sync.pump(&node.transport)?;
        }
        for node in &self.nodes {
            while let Some(envelope) = self.network.receive(node.id)? {
                node.sync.receive(&envelope)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Steps until nothing moves. Returns the envelopes moved.
    ///
    /// # Panics
    ///
    /// On a synchronization error, or when the mesh never quiesces.
    pub fn settle(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_ROUNDS {
            let moved = self.step().expect("mesh step failed");
            if moved == 0 {
                return total;
            }
            total += moved;
        }
        panic!("mesh did not settle after {MAX_ROUNDS} rounds");
    }

    /// Notes held by node `index`.
    pub fn notes(&self, index: usize) -> BTreeMap<i64, String> {
        notes(self.nodes[index].db())
    }

    /// Returns true when every node holds the same notes.
    pub fn converged(&self) -> bool {
        let first = self.notes(0);
        (1..self.nodes.len()).all(|i| self.notes(i) == first)
    }

    /// Last log id of node `index`.
    pub fn last_transaction_id(&self, index: usize) -> TransactionId {
        self.nodes[index]
            .db()
            .last_transaction_id()
            .expect("Failed to read log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_reach_every_linked_node() {
        let mesh = Mesh::new(2);
        mesh.connect(0, 1);
        mesh.settle();
        mesh.apply(
            0,
            &NoteOp::Put {
                id: 1,
                body: "hello".into(),
            },
        );
        mesh.settle();
        assert!(mesh.converged());
        assert_eq!(mesh.notes(1).len(), 1);
    }

    #[test]
    fn nodes_are_registered_with_each_other() {
        let mesh = Mesh::new(3);
        for i in 0..3 {
            let hooks = mesh.node(i).db().hooks().unwrap();
            let paired = hooks
                .iter()
                .filter(|h| !h.concerns_local_host && h.pairing_state == PairingState::Paired)
                .count();
            assert_eq!(paired, 2);
        }
    }
}
