// Broadcast Rules (§4.7): only the primary broadcasts, and only three
// shapes exist.

use std::sync::Arc;

use crate::message::Payload;
use crate::node::ControllerNode;
use crate::types::{NodeDefinition, NodeType};

/// Pushes the current chunk map to every connected Controller and Query
/// peer, serially, each awaited. Holds the chunk-map lock for the
/// duration of the snapshot only — the sends themselves happen after
/// the lock is released.
pub fn broadcast_chunk_list(node: &Arc<ControllerNode>) {
    if !node.is_primary() {
        return;
    }
    let chunks = node.chunk_map.snapshot();
    for (addr, node_type) in node.transport.list_peers() {
        if addr == node.self_addr {
            continue;
        }
        if !matches!(node_type, Some(NodeType::Controller) | Some(NodeType::Query)) {
            continue;
        }
        let payload = Payload::ChunkListUpdate {
            chunks: chunks.clone(),
        };
        if let Ok(handle) = node.transport.send_message(&addr, payload, true) {
            let _ = handle.block_until_done();
        }
    }
}

/// Sends the node list for `source_type` to every connected peer of
/// `dest_type` (e.g. storage list to query peers, query list to API
/// peers).
pub fn broadcast_node_list_to_type(node: &Arc<ControllerNode>, source_type: NodeType, dest_type: NodeType) {
    let nodes = node.list_of_type(source_type);
    for dest in node.list_of_type(dest_type) {
        let payload = Payload::NodeList {
            node_type: source_type,
            nodes: nodes.clone(),
        };
        let _ = node.transport.send_message(&dest, payload, false);
    }
}

/// Sends the node list for `source_type` to a single peer, used right
/// after that peer's own join completes.
pub fn send_node_list(node: &Arc<ControllerNode>, dest: &NodeDefinition, source_type: NodeType) {
    let nodes = node.list_of_type(source_type);
    let payload = Payload::NodeList {
        node_type: source_type,
        nodes,
    };
    let _ = node.transport.send_message(dest, payload, false);
}
