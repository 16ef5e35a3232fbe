// Peer Registry (C1): tracks live connections and their classified
// role. This is not owned by `ControllerNode` directly — the peer
// registry is guarded by the transport (§5), so a `Transport`
// implementation (a TCP listener, or `LoopbackTransport` in
// `test_support`) embeds one of these to back its
// `rename`/`has_peer`/`list_peers`/`mark_established` methods.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::warn;

use crate::types::{NodeDefinition, NodeType, Peer, PeerState};

#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<NodeDefinition, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry::default()
    }

    /// Records a peer at `addr`, either type-less (still handshaking) or
    /// already classified.
    pub fn record(&self, addr: NodeDefinition, node_type: Option<NodeType>) {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(
            addr.clone(),
            Peer {
                address: addr,
                node_type,
                state: if node_type.is_some() {
                    PeerState::Established
                } else {
                    PeerState::Handshaking
                },
            },
        );
    }

    /// Reassigns an entry from its ephemeral transport-level address to
    /// the canonical address the peer declared during join. If the
    /// canonical key is already occupied, the existing entry wins and
    /// the rename is dropped with a logged warning (first-won policy,
    /// see §4.1) — this avoids live-connection thrash on duplicate
    /// joins, at the cost of leaving the new (duplicate) connection
    /// registered under its old ephemeral key until it disconnects.
    pub fn rename(&self, old_addr: &NodeDefinition, new_addr: NodeDefinition) {
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(&new_addr) {
            // The canonical identity is already registered (first-won):
            // keep that entry and drop the duplicate ephemeral one
            // entirely, rather than leaving it stranded under its old key.
            peers.remove(old_addr);
            warn!(old = %old_addr, new = %new_addr, "duplicate join: canonical address already registered, dropping rename");
            return;
        }
        if let Some(mut peer) = peers.remove(old_addr) {
            peer.address = new_addr.clone();
            peers.insert(new_addr, peer);
        }
    }

    pub fn mark_established(&self, addr: &NodeDefinition, node_type: NodeType) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.get_mut(addr) {
            peer.node_type = Some(node_type);
            peer.state = PeerState::Established;
        } else {
            peers.insert(
                addr.clone(),
                Peer {
                    address: addr.clone(),
                    node_type: Some(node_type),
                    state: PeerState::Established,
                },
            );
        }
    }

    pub fn close(&self, addr: &NodeDefinition) -> Option<Peer> {
        let mut peers = self.peers.lock().unwrap();
        peers.remove(addr)
    }

    pub fn list(&self) -> Vec<(NodeDefinition, Option<NodeType>)> {
        let peers = self.peers.lock().unwrap();
        peers
            .values()
            .map(|p| (p.address.clone(), p.node_type))
            .collect()
    }

    pub fn list_of_type(&self, node_type: NodeType) -> Vec<NodeDefinition> {
        let peers = self.peers.lock().unwrap();
        peers
            .values()
            .filter(|p| p.node_type == Some(node_type))
            .map(|p| p.address.clone())
            .collect()
    }

    pub fn has(&self, addr: &NodeDefinition) -> bool {
        self.peers.lock().unwrap().contains_key(addr)
    }

    pub fn has_established_type(&self, addr: &NodeDefinition, node_type: NodeType) -> bool {
        let peers = self.peers.lock().unwrap();
        peers
            .get(addr)
            .map(|p| p.node_type == Some(node_type) && p.state == PeerState::Established)
            .unwrap_or(false)
    }

    pub fn first_of_type(&self, node_type: NodeType) -> Option<NodeDefinition> {
        let peers = self.peers.lock().unwrap();
        peers
            .values()
            .find(|p| p.node_type == Some(node_type))
            .map(|p| p.address.clone())
    }
}
