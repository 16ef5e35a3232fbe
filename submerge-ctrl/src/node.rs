// ControllerState and the message dispatcher (glue): the struct that
// owns every other component and routes each incoming envelope to the
// right one by its semantic type (§2's "Message dispatcher").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::chunkmap::ChunkMap;
use crate::config::ControllerSettings;
use crate::election;
use crate::join;
use crate::message::{Envelope, JoinSettings, MessageIdAllocator, Payload};
use crate::proxy;
use crate::transport::Transport;
use crate::types::{NodeDefinition, NodeType};
use submerge_base::Error;

struct NodeState {
    primary: Option<NodeDefinition>,
    last_primary_message_id: u32,
}

/// Everything one controller replica needs to run: its own identity,
/// the static controller set, the transport it talks through, and the
/// mutable components (chunk map, primary/watermark state) the
/// dispatcher coordinates. The peer registry itself is not duplicated
/// here — it lives behind the transport (§5 "the peer registry is
/// guarded by the transport"), reached through `rename`/`has_peer`/
/// `list_peers`/`mark_established`.
pub struct ControllerNode {
    pub self_addr: NodeDefinition,
    pub controllers: Vec<NodeDefinition>,
    pub settings: ControllerSettings,
    pub chunk_map: ChunkMap,
    pub transport: Arc<dyn Transport>,
    state: Mutex<NodeState>,
    id_alloc: MessageIdAllocator,
    running: AtomicBool,
}

/// Why a startup/reconciler connect attempt to a configured controller
/// did not succeed.
pub enum ConnectError {
    /// The peer rejected the join outright: this node is misconfigured
    /// relative to the cluster and must not keep running (§7.1).
    Fatal(String),
    /// No usable response within the transport's timeout; transient,
    /// safe to retry on the next reconciler tick.
    Timeout,
}

impl ControllerNode {
    pub fn new(
        self_addr: NodeDefinition,
        controllers: Vec<NodeDefinition>,
        settings: ControllerSettings,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(ControllerNode {
            self_addr,
            controllers,
            settings,
            chunk_map: ChunkMap::new(),
            transport,
            state: Mutex::new(NodeState {
                primary: None,
                last_primary_message_id: 0,
            }),
            id_alloc: MessageIdAllocator::new(),
            running: AtomicBool::new(true),
        })
    }

    pub fn next_message_id(&self) -> u32 {
        self.id_alloc.next()
    }

    pub fn is_primary(&self) -> bool {
        self.state.lock().unwrap().primary.as_ref() == Some(&self.self_addr)
    }

    pub fn primary(&self) -> Option<NodeDefinition> {
        self.state.lock().unwrap().primary.clone()
    }

    pub fn set_primary(&self, addr: NodeDefinition) {
        let mut state = self.state.lock().unwrap();
        state.primary = Some(addr);
        state.last_primary_message_id = 0;
    }

    pub fn clear_primary(&self) {
        let mut state = self.state.lock().unwrap();
        if state.primary.is_some() {
            state.primary = None;
            state.last_primary_message_id = 0;
        }
    }

    pub fn last_primary_message_id(&self) -> u32 {
        self.state.lock().unwrap().last_primary_message_id
    }

    /// `lastPrimaryMessageId` takes the max of every ID seen from the
    /// current primary, tolerating out-of-order delivery (§5).
    pub fn note_message_from(&self, from: &NodeDefinition, id: u32) {
        let mut state = self.state.lock().unwrap();
        if state.primary.as_ref() == Some(from) {
            state.last_primary_message_id = state.last_primary_message_id.max(id);
        }
    }

    pub fn join_settings(&self) -> JoinSettings {
        JoinSettings {
            connection_string: self.settings.connection_string.clone(),
            max_chunk_item_count: self.settings.max_chunk_item_count,
            redundant_nodes_per_location: self.settings.redundant_nodes_per_location,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Whether `addr` has any entry in the transport's connection table,
    /// classified or not.
    pub fn has_peer(&self, addr: &NodeDefinition) -> bool {
        self.transport.has_peer(addr)
    }

    /// Whether `addr` is classified as an established `Controller` peer;
    /// the only registry query the election round needs (§4.4).
    pub fn has_established_controller(&self, addr: &NodeDefinition) -> bool {
        self.transport
            .list_peers()
            .into_iter()
            .any(|(a, ty)| &a == addr && ty == Some(NodeType::Controller))
    }

    pub fn list_of_type(&self, node_type: NodeType) -> Vec<NodeDefinition> {
        self.transport
            .list_peers()
            .into_iter()
            .filter(|(_, ty)| *ty == Some(node_type))
            .map(|(addr, _)| addr)
            .collect()
    }

    pub fn first_of_type(&self, node_type: NodeType) -> Option<NodeDefinition> {
        self.transport
            .list_peers()
            .into_iter()
            .find(|(_, ty)| *ty == Some(node_type))
            .map(|(addr, _)| addr)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Wires the dispatcher and connection-loss handler into the
    /// transport. Called once, right after construction.
    pub fn install_callbacks(self: &Arc<Self>) {
        let dispatch_node = Arc::clone(self);
        self.transport.on_message_received(Box::new(move |from, env| {
            dispatch(&dispatch_node, from, env);
        }));
        let lost_node = Arc::clone(self);
        self.transport
            .on_connection_lost(Box::new(move |addr, node_type| {
                handle_connection_lost(&lost_node, addr, node_type);
            }));
    }

    /// `ConnectToController`: opens a transport link to `addr` and
    /// performs the controller-to-controller join handshake. Shared by
    /// startup join (§4.8) and the reconciler (§4.5 step 1).
    pub fn connect_to_controller(self: &Arc<Self>, addr: &NodeDefinition) -> Result<(), ConnectError> {
        self.transport.connect(addr).map_err(|e| {
            debug!(err = ?e, "connect attempt failed");
            ConnectError::Timeout
        })?;
        let payload = Payload::JoinAttempt {
            node_type: NodeType::Controller,
            name: self.self_addr.hostname.clone(),
            port: self.self_addr.port,
            settings: self.join_settings(),
            is_primary_claim: self.is_primary(),
        };
        let handle = self
            .transport
            .send_message(addr, payload, true)
            .map_err(|_| ConnectError::Timeout)?;
        let outcome = handle.block_until_done();
        if !outcome.success {
            return Err(ConnectError::Timeout);
        }
        match outcome.response {
            Some(env) => match env.payload {
                Payload::JoinFailure { reason } => Err(ConnectError::Fatal(reason)),
                Payload::JoinSuccess { primary_controller, .. } => {
                    self.transport.mark_established(addr, NodeType::Controller);
                    // `JoinSuccess` is itself flagged `waiting_for_response`
                    // (the sender blocks on it), so the ack must carry
                    // `in_response_to == env.id`, not go out as a fresh,
                    // uncorrelated message.
                    let _ = self.transport.send_reply(&env, Payload::Acknowledgement, false);
                    if primary_controller {
                        self.set_primary(addr.clone());
                    }
                    Ok(())
                }
                _ => Err(ConnectError::Timeout),
            },
            None => Err(ConnectError::Timeout),
        }
    }

    /// Performs startup join against every other configured controller.
    /// A `JoinFailure` from any of them is fatal, and so is `self` being
    /// absent from the configured controller set (§6 "Exit codes").
    pub fn startup_join(self: &Arc<Self>) -> Result<(), Error> {
        if !self.controllers.contains(&self.self_addr) {
            return Err(submerge_base::err(format!(
                "self ({}) is not present in the configured controller set",
                self.self_addr
            )));
        }
        if self.controllers.len() == 1 {
            // Sole controller: become primary directly, no voting (§8 scenario 1).
            info!(self = %self.self_addr, "sole configured controller, becoming primary without voting");
            self.set_primary(self.self_addr.clone());
            return Ok(());
        }
        for peer in self.controllers.iter().filter(|c| **c != self.self_addr) {
            match self.connect_to_controller(peer) {
                Ok(()) => {}
                Err(ConnectError::Fatal(reason)) => {
                    return Err(submerge_base::err(format!(
                        "controller {peer} rejected join: {reason}"
                    )));
                }
                Err(ConnectError::Timeout) => {
                    warn!(peer = %peer, "startup connect to controller timed out, reconciler will retry");
                }
            }
        }
        Ok(())
    }
}

/// Routes one inbound envelope to the component that owns its semantic
/// type (§2 "Message dispatcher"). Every handler is a terminal unit of
/// work: no error crosses this function's boundary (§7).
pub fn dispatch(node: &Arc<ControllerNode>, from: NodeDefinition, env: Envelope) {
    node.note_message_from(&from, env.id);
    debug!(from = %from, id = env.id, "dispatching message");
    match &env.payload {
        Payload::JoinAttempt {
            node_type,
            name,
            port,
            settings,
            is_primary_claim,
        } => join::handle_join_attempt(
            node,
            &from,
            &env,
            *node_type,
            name.clone(),
            *port,
            settings.clone(),
            *is_primary_claim,
        ),
        Payload::VotingRequest => {
            let response = election::handle_voting_request(node, &from);
            let _ = node.transport.send_reply(&env, response, false);
        }
        Payload::LastPrimaryMessageIdRequest => {
            let response = Payload::LastPrimaryMessageIdResponse {
                last_primary_message_id: node.last_primary_message_id(),
            };
            let _ = node.transport.send_reply(&env, response, false);
        }
        Payload::PrimaryAnnouncement { primary } => {
            election::handle_primary_announcement(node, primary.clone());
        }
        Payload::ChunkSplit {
            start1,
            end1,
            start2,
            end2,
        } => {
            // Only the primary authoritatively mutates the chunk map
            // (§2, C2); a split reaching a non-primary is a stale or
            // misrouted report and is acknowledged without effect.
            if node.is_primary() {
                node.chunk_map
                    .apply_split(start1.clone(), end1.clone(), start2.clone(), end2.clone(), from.clone());
                crate::broadcast::broadcast_chunk_list(node);
            } else {
                warn!(from = %from, "chunk split reported to a non-primary, ignoring");
            }
            let _ = node.transport.send_reply(&env, Payload::Acknowledgement, false);
        }
        Payload::ChunkMerge { start, end } => {
            if node.is_primary() {
                node.chunk_map.apply_merge(start.clone(), end.clone(), from.clone());
                crate::broadcast::broadcast_chunk_list(node);
            } else {
                warn!(from = %from, "chunk merge reported to a non-primary, ignoring");
            }
            let _ = node.transport.send_reply(&env, Payload::Acknowledgement, false);
        }
        Payload::ChunkListUpdate { chunks } => {
            if !node.is_primary() {
                node.chunk_map.replace(chunks.clone());
            }
            // Acknowledged so the primary's broadcast (sent with
            // `waiting_for_response = true`, §4.7 "each awaited") returns
            // as soon as this peer has applied the update rather than
            // blocking for the full transport timeout on every peer.
            let _ = node.transport.send_reply(&env, Payload::Acknowledgement, false);
        }
        Payload::DataOperation { body } => {
            let result = proxy::proxy_data_operation(node, body.clone());
            let _ = node.transport.send_reply(&env, result, false);
        }
        Payload::DatabaseCreate => {
            // The controller core never receives this as a server: it is
            // only ever the sender, toward storage peers. Acknowledge
            // defensively rather than leaving the sender's request
            // hanging if a misbehaving peer loops it back.
            let _ = node.transport.send_reply(&env, Payload::Acknowledgement, false);
        }
        Payload::JoinSuccess { .. }
        | Payload::JoinFailure { .. }
        | Payload::Acknowledgement
        | Payload::VotingResponse { .. }
        | Payload::LastPrimaryMessageIdResponse { .. }
        | Payload::NodeList { .. }
        | Payload::DataOperationResult { .. }
        | Payload::DatabaseCreateFailure { .. } => {
            // These only ever arrive as the correlated response half of a
            // blocking request and are consumed by `block_until_done`,
            // not by the dispatcher.
            debug!("received response-only payload outside a pending request, ignoring");
        }
    }
}

/// `onConnectionLost` handling (§6): updates the registry, clears a lost
/// primary, removes a lost storage owner's chunks, and re-checks the
/// quorum precondition (§4.4).
pub fn handle_connection_lost(node: &Arc<ControllerNode>, addr: NodeDefinition, node_type: Option<NodeType>) {
    match node_type {
        Some(NodeType::Storage) => {
            node.chunk_map.remove_owner(&addr);
        }
        Some(NodeType::Controller) => {
            if node.primary().as_ref() == Some(&addr) {
                node.clear_primary();
            }
            if !election::has_quorum(node) {
                node.clear_primary();
            }
        }
        _ => {}
    }
}
