// Leader Election (C4): quorum-gated voting, tie-broken by connection
// name, and primary announcement.

use std::sync::Arc;
use tracing::info;

use crate::message::Payload;
use crate::node::ControllerNode;
use crate::types::NodeDefinition;

/// `active = 1 + |{c : peerRegistry.has(c) and type == Controller}|`.
fn active_count(node: &Arc<ControllerNode>) -> usize {
    1 + node
        .controllers
        .iter()
        .filter(|c| **c != node.self_addr)
        .filter(|c| node.has_established_controller(c))
        .count()
}

/// A strict majority of the configured controller set is reachable.
/// Evaluated both before voting and on every controller disconnect.
pub fn has_quorum(node: &Arc<ControllerNode>) -> bool {
    let active = active_count(node);
    active > node.controllers.len() / 2
}

/// Runs one round of candidacy: checks the quorum precondition, polls
/// every other controller with a `VotingRequest`, and becomes primary
/// iff every response was `true` and at least one arrived. Returns
/// whether this replica became primary.
pub fn initiate_voting(node: &Arc<ControllerNode>) -> bool {
    if !has_quorum(node) {
        info!("no quorum, declining to initiate voting");
        return false;
    }

    let mut any_response = false;
    let mut all_true = true;
    for peer in node.controllers.iter().filter(|c| **c != node.self_addr) {
        let outcome = match node.transport.send_message(peer, Payload::VotingRequest, true) {
            Ok(handle) => handle.block_until_done(),
            Err(_) => continue,
        };
        if !outcome.success {
            continue;
        }
        any_response = true;
        match outcome.response.map(|e| e.payload) {
            Some(Payload::VotingResponse { answer: true }) => {}
            _ => all_true = false,
        }
    }

    if !any_response || !all_true {
        return false;
    }

    // A concurrent `PrimaryAnnouncement` may have landed while we were
    // polling; defer to it rather than overwriting (§4.4).
    if node.primary().is_some() {
        info!("primary discovered during voting");
        return false;
    }
    node.set_primary(node.self_addr.clone());
    info!(primary = %node.self_addr, "won election, announcing primary");
    for peer in node.controllers.iter().filter(|c| **c != node.self_addr) {
        let _ = node.transport.send_message(
            peer,
            Payload::PrimaryAnnouncement {
                primary: node.self_addr.clone(),
            },
            false,
        );
    }
    true
}

/// Answers a `VotingRequest` from `candidate`.
pub fn handle_voting_request(node: &Arc<ControllerNode>, candidate: &NodeDefinition) -> Payload {
    if node.primary().is_some() {
        return Payload::VotingResponse { answer: false };
    }

    let mut pairs: Vec<(NodeDefinition, u32)> = Vec::new();
    for peer in node.controllers.iter().filter(|c| **c != node.self_addr) {
        let outcome = match node
            .transport
            .send_message(peer, Payload::LastPrimaryMessageIdRequest, true)
        {
            Ok(handle) => handle.block_until_done(),
            Err(_) => continue,
        };
        if !outcome.success {
            continue;
        }
        if let Some(env) = outcome.response {
            if let Payload::LastPrimaryMessageIdResponse {
                last_primary_message_id,
            } = env.payload
            {
                pairs.push((peer.clone(), last_primary_message_id));
            }
        }
    }

    let Some(max_id) = pairs.iter().map(|(_, id)| *id).max() else {
        return Payload::VotingResponse { answer: false };
    };
    let mut top: Vec<&NodeDefinition> = pairs
        .iter()
        .filter(|(_, id)| *id == max_id)
        .map(|(peer, _)| peer)
        .collect();
    top.sort_by_key(|p| p.connection_name());

    let answer = top.first().map(|p| *p == candidate).unwrap_or(false);
    Payload::VotingResponse { answer }
}

/// A `PrimaryAnnouncement` replaces our primary unconditionally — the
/// sender only ever broadcasts this after winning a round it is
/// entitled to win.
pub fn handle_primary_announcement(node: &Arc<ControllerNode>, primary: NodeDefinition) {
    info!(primary = %primary, "primary announcement received");
    node.set_primary(primary);
}
