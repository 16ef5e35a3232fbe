// Join/Admission Protocol (C3): per-type compatibility checks and the
// admission sequence for each of the five peer roles.

use std::sync::Arc;
use tracing::{info, warn};

use crate::broadcast;
use crate::message::{Envelope, JoinSettings, Payload};
use crate::node::ControllerNode;
use crate::types::{NodeDefinition, NodeType};

#[allow(clippy::too_many_arguments)]
pub fn handle_join_attempt(
    node: &Arc<ControllerNode>,
    from: &NodeDefinition,
    request: &Envelope,
    node_type: NodeType,
    name: String,
    port: u16,
    settings: JoinSettings,
    is_primary_claim: bool,
) {
    let canonical = NodeDefinition::new(name, port);
    match node_type {
        NodeType::Controller => handle_controller_join(node, from, request, canonical, settings, is_primary_claim),
        NodeType::Query => handle_query_join(node, from, request, canonical, settings),
        NodeType::Storage => handle_storage_join(node, from, request, canonical, settings),
        NodeType::Api => handle_api_join(node, from, request, canonical, settings),
        NodeType::Console => handle_console_join(node, from, request, canonical),
    }
}

fn reject(node: &Arc<ControllerNode>, request: &Envelope, reason: &str) {
    warn!(reason, "rejecting join attempt");
    let _ = node
        .transport
        .send_reply(request, Payload::JoinFailure { reason: reason.to_string() }, false);
}

fn admit(node: &Arc<ControllerNode>, from: &NodeDefinition, canonical: &NodeDefinition, node_type: NodeType) {
    node.transport.rename(from, canonical);
    node.transport.mark_established(canonical, node_type);
}

fn handle_controller_join(
    node: &Arc<ControllerNode>,
    from: &NodeDefinition,
    request: &Envelope,
    canonical: NodeDefinition,
    settings: JoinSettings,
    is_primary_claim: bool,
) {
    if settings != node.join_settings() {
        reject(node, request, "controller settings mismatch");
        return;
    }
    admit(node, from, &canonical, NodeType::Controller);
    let reply = Payload::JoinSuccess {
        primary_controller: node.is_primary(),
        max_chunk_item_count: None,
    };
    let outcome = match node.transport.send_reply(request, reply, true) {
        Ok(handle) => handle.block_until_done(),
        Err(_) => return,
    };
    if !outcome.success {
        return;
    }
    if is_primary_claim {
        node.set_primary(canonical.clone());
    }
    info!(peer = %canonical, "controller joined");
    broadcast::broadcast_chunk_list(node);
}

fn handle_query_join(
    node: &Arc<ControllerNode>,
    from: &NodeDefinition,
    request: &Envelope,
    canonical: NodeDefinition,
    settings: JoinSettings,
) {
    if settings.connection_string != node.settings.connection_string {
        reject(node, request, "connection string mismatch");
        return;
    }
    admit(node, from, &canonical, NodeType::Query);
    let reply = Payload::JoinSuccess {
        primary_controller: node.is_primary(),
        max_chunk_item_count: None,
    };
    let outcome = match node.transport.send_reply(request, reply, true) {
        Ok(handle) => handle.block_until_done(),
        Err(_) => return,
    };
    if !outcome.success {
        return;
    }
    info!(peer = %canonical, "query node joined");
    broadcast::send_node_list(node, &canonical, NodeType::Storage);
    broadcast::broadcast_node_list_to_type(node, NodeType::Query, NodeType::Api);
    broadcast::broadcast_chunk_list(node);
}

fn handle_storage_join(
    node: &Arc<ControllerNode>,
    from: &NodeDefinition,
    request: &Envelope,
    canonical: NodeDefinition,
    settings: JoinSettings,
) {
    if settings.connection_string != node.settings.connection_string {
        reject(node, request, "connection string mismatch");
        return;
    }
    admit(node, from, &canonical, NodeType::Storage);
    let is_primary = node.is_primary();
    let reply = Payload::JoinSuccess {
        primary_controller: is_primary,
        max_chunk_item_count: if is_primary {
            Some(node.settings.max_chunk_item_count)
        } else {
            None
        },
    };
    let outcome = match node.transport.send_reply(request, reply, true) {
        Ok(handle) => handle.block_until_done(),
        Err(_) => return,
    };
    if !outcome.success {
        return;
    }
    info!(peer = %canonical, "storage node joined");
    broadcast::broadcast_node_list_to_type(node, NodeType::Storage, NodeType::Query);

    if is_primary && node.chunk_map.is_empty() {
        bootstrap_database(node, canonical);
    }
}

/// Installs the initial `[Start, End)` chunk for the first storage node
/// to join, then requires exactly one `DatabaseCreate` success before
/// committing to it; rolls back on universal rejection (§4.3, §8
/// scenario 5).
fn bootstrap_database(node: &Arc<ControllerNode>, owner: NodeDefinition) {
    node.chunk_map.install(owner);
    let storages = node.list_of_type(NodeType::Storage);
    let mut created = false;
    for storage in &storages {
        let outcome = match node.transport.send_message(storage, Payload::DatabaseCreate, true) {
            Ok(handle) => handle.block_until_done(),
            Err(_) => continue,
        };
        if outcome.success && matches!(outcome.response.map(|e| e.payload), Some(Payload::Acknowledgement)) {
            created = true;
            break;
        }
    }
    if created {
        broadcast::broadcast_chunk_list(node);
    } else {
        warn!("database-create rejected by every storage node, rolling back chunk map");
        node.chunk_map.clear();
    }
}

fn handle_api_join(
    node: &Arc<ControllerNode>,
    from: &NodeDefinition,
    request: &Envelope,
    canonical: NodeDefinition,
    settings: JoinSettings,
) {
    // API peers send their connection string as the entire `settings`
    // payload rather than an XML document; only that field is checked.
    if settings.connection_string != node.settings.connection_string {
        reject(node, request, "connection string mismatch");
        return;
    }
    admit(node, from, &canonical, NodeType::Api);
    let reply = Payload::JoinSuccess {
        primary_controller: node.is_primary(),
        max_chunk_item_count: None,
    };
    let outcome = match node.transport.send_reply(request, reply, true) {
        Ok(handle) => handle.block_until_done(),
        Err(_) => return,
    };
    if !outcome.success {
        return;
    }
    info!(peer = %canonical, "API node joined");
    broadcast::send_node_list(node, &canonical, NodeType::Query);
}

fn handle_console_join(node: &Arc<ControllerNode>, from: &NodeDefinition, request: &Envelope, canonical: NodeDefinition) {
    admit(node, from, &canonical, NodeType::Console);
    let reply = Payload::JoinSuccess {
        primary_controller: node.is_primary(),
        max_chunk_item_count: None,
    };
    let _ = node.transport.send_reply(request, reply, false);
    info!(peer = %canonical, "console connected");
}
