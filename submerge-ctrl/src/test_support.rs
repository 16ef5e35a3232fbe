// In-memory `Transport` used by this crate's own tests: every node
// under test lives in one process, "connections" are just entries in a
// shared address table, and delivery happens over a channel and a
// small worker pool per node rather than a socket. Mirrors the
// pending-slot / reply-routing bookkeeping a real transport (§4.0)
// would do with sockets and a reader thread.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use submerge_base::Error;

use crate::message::{Envelope, MessageIdAllocator, Payload};
use crate::registry::PeerRegistry;
use crate::transport::{ConnectionLostCallback, MessageCallback, PendingSlot, SendHandle, Transport};
use crate::types::{NodeDefinition, NodeType};

/// How many worker threads each node's transport uses to drain its
/// inbox. Needs to be more than one: a handler answering one request
/// (e.g. `VotingRequest`) commonly issues its own blocking request to a
/// third party and must not starve the rest of the node's traffic
/// while it waits.
const WORKERS_PER_NODE: usize = 4;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A shared address book: every `LoopbackTransport` created against the
/// same network can reach every other one by `NodeDefinition`.
pub struct LoopbackNetwork {
    nodes: Mutex<HashMap<NodeDefinition, Arc<LoopbackTransport>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackNetwork {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a transport for `addr` and registers it on this network.
    /// Spawns the worker pool that drains its inbox.
    pub fn create_transport(self: &Arc<Self>, addr: NodeDefinition) -> Arc<LoopbackTransport> {
        let (tx, rx) = channel::<(NodeDefinition, Envelope)>();
        let transport = Arc::new(LoopbackTransport {
            addr: addr.clone(),
            network: Arc::clone(self),
            registry: PeerRegistry::new(),
            pending: Mutex::new(HashMap::new()),
            reply_routes: Mutex::new(HashMap::new()),
            id_alloc: MessageIdAllocator::new(),
            message_cb: Mutex::new(None),
            lost_cb: Mutex::new(None),
            inbox: tx,
            timeout: DEFAULT_TIMEOUT,
            blocked: Mutex::new(std::collections::HashSet::new()),
        });
        self.nodes.lock().unwrap().insert(addr, Arc::clone(&transport));

        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..WORKERS_PER_NODE {
            let worker_transport = Arc::clone(&transport);
            let worker_rx = Arc::clone(&rx);
            thread::spawn(move || loop {
                let next = { worker_rx.lock().unwrap().recv() };
                match next {
                    Ok((from, env)) => worker_transport.receive(from, env),
                    Err(_) => return,
                }
            });
        }
        transport
    }

    fn lookup(&self, addr: &NodeDefinition) -> Option<Arc<LoopbackTransport>> {
        self.nodes.lock().unwrap().get(addr).cloned()
    }

    /// Test-only: severs the link between `a` and `b` from both sides,
    /// as a crash or partition would. Each side fires its own
    /// connection-lost callback with the type it had recorded for the
    /// other.
    pub fn sever(&self, a: &NodeDefinition, b: &NodeDefinition) {
        if let Some(ta) = self.lookup(a) {
            ta.simulate_disconnect(b);
        }
        if let Some(tb) = self.lookup(b) {
            tb.simulate_disconnect(a);
        }
    }
}

pub struct LoopbackTransport {
    addr: NodeDefinition,
    network: Arc<LoopbackNetwork>,
    registry: PeerRegistry,
    pending: Mutex<HashMap<u32, Arc<PendingSlot>>>,
    /// Which address an inbound request with a given id arrived from,
    /// so `send_reply` knows where to send without the core having to
    /// pass `from` back in.
    reply_routes: Mutex<HashMap<u32, NodeDefinition>>,
    id_alloc: MessageIdAllocator,
    message_cb: Mutex<Option<MessageCallback>>,
    lost_cb: Mutex<Option<ConnectionLostCallback>>,
    inbox: Sender<(NodeDefinition, Envelope)>,
    timeout: Duration,
    /// Addresses a test has severed via `simulate_disconnect`; routing to
    /// (or re-connecting to) one of these fails until it is dropped from
    /// the set, same as a torn-down socket would refuse further writes.
    blocked: Mutex<std::collections::HashSet<NodeDefinition>>,
}

impl LoopbackTransport {
    fn receive(&self, from: NodeDefinition, env: Envelope) {
        if self.blocked.lock().unwrap().contains(&from) {
            return;
        }
        if !self.registry.has(&from) {
            self.registry.record(from.clone(), None);
        }
        // Recorded for every inbound envelope, not just fresh requests:
        // a response can itself demand a reply (e.g. `JoinSuccess` is a
        // response to `JoinAttempt` but still waits on an `Acknowledgement`
        // correlated to its own id), so whoever receives it must be able
        // to route a reply back without the core passing `from` again.
        self.reply_routes.lock().unwrap().insert(env.id, from.clone());

        if env.in_response_to != 0 {
            if let Some(slot) = self.pending.lock().unwrap().remove(&env.in_response_to) {
                slot.resolve(env);
            }
            // No matching pending slot (the request already timed out):
            // the response is simply dropped, as on a real socket whose
            // reader no longer has anyone waiting on that id.
            return;
        }
        if let Some(cb) = self.message_cb.lock().unwrap().as_ref() {
            cb(from, env);
        }
    }

    fn route(&self, addr: &NodeDefinition, env: Envelope) -> Result<(), Error> {
        if self.blocked.lock().unwrap().contains(addr) {
            return Err(submerge_base::err(format!("link to {addr} is down")));
        }
        let target = self
            .network
            .lookup(addr)
            .ok_or_else(|| submerge_base::err(format!("no route to {addr}")))?;
        target
            .inbox
            .send((self.addr.clone(), env))
            .map_err(|_| submerge_base::err(format!("peer {addr} is gone")))
    }

    /// Test-only: simulates the underlying connection to `addr` failing,
    /// as a crash or partition would. Blocks further routing in either
    /// direction until the test reconnects explicitly.
    pub fn simulate_disconnect(&self, addr: &NodeDefinition) {
        self.blocked.lock().unwrap().insert(addr.clone());
        let peer = self.registry.close(addr);
        let node_type = peer.and_then(|p| p.node_type);
        if let Some(cb) = self.lost_cb.lock().unwrap().as_ref() {
            cb(addr.clone(), node_type);
        }
    }
}

impl Transport for LoopbackTransport {
    fn send_message(&self, addr: &NodeDefinition, payload: Payload, waiting_for_response: bool) -> Result<SendHandle, Error> {
        let id = self.id_alloc.next();
        let env = Envelope {
            id,
            in_response_to: 0,
            waiting_for_response,
            payload,
        };
        if !waiting_for_response {
            self.route(addr, env)?;
            return Ok(SendHandle::immediate_success());
        }
        let slot = PendingSlot::new();
        self.pending.lock().unwrap().insert(id, Arc::clone(&slot));
        if let Err(e) = self.route(addr, env) {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }
        Ok(SendHandle::pending(slot, self.timeout))
    }

    fn send_reply(&self, request: &Envelope, payload: Payload, waiting_for_response: bool) -> Result<SendHandle, Error> {
        let dest = self
            .reply_routes
            .lock()
            .unwrap()
            .remove(&request.id)
            .ok_or_else(|| submerge_base::err("no known reply route for that request id"))?;
        let id = self.id_alloc.next();
        let env = Envelope {
            id,
            in_response_to: request.id,
            waiting_for_response,
            payload,
        };
        if !waiting_for_response {
            self.route(&dest, env)?;
            return Ok(SendHandle::immediate_success());
        }
        let slot = PendingSlot::new();
        self.pending.lock().unwrap().insert(id, Arc::clone(&slot));
        if let Err(e) = self.route(&dest, env) {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }
        Ok(SendHandle::pending(slot, self.timeout))
    }

    fn on_message_received(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    fn on_connection_lost(&self, cb: ConnectionLostCallback) {
        *self.lost_cb.lock().unwrap() = Some(cb);
    }

    fn rename(&self, old_addr: &NodeDefinition, new_addr: &NodeDefinition) {
        self.registry.rename(old_addr, new_addr.clone());
    }

    fn has_peer(&self, addr: &NodeDefinition) -> bool {
        self.registry.has(addr)
    }

    fn list_peers(&self) -> Vec<(NodeDefinition, Option<NodeType>)> {
        self.registry.list()
    }

    fn mark_established(&self, addr: &NodeDefinition, node_type: NodeType) {
        self.registry.mark_established(addr, node_type);
    }

    fn connect(&self, addr: &NodeDefinition) -> Result<(), Error> {
        if self.blocked.lock().unwrap().contains(addr) {
            return Err(submerge_base::err(format!("link to {addr} is down")));
        }
        if self.registry.has(addr) {
            return Ok(());
        }
        if self.network.lookup(addr).is_none() {
            return Err(submerge_base::err(format!("no such node {addr} on this network")));
        }
        self.registry.record(addr.clone(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ControllerNode;
    use test_log::test;

    fn addr(port: u16) -> NodeDefinition {
        NodeDefinition::new("127.0.0.1", port)
    }

    #[test]
    fn two_nodes_exchange_a_blocking_request() {
        let network = LoopbackNetwork::new();
        let a = network.create_transport(addr(1));
        let b = network.create_transport(addr(2));

        a.on_message_received(Box::new(move |_from, env| {
            // Echo back whatever arrived, so the sender's block resolves.
            let _ = b.send_reply(&env, env.payload.clone(), false);
        }));

        let handle = a
            .send_message(&addr(2), Payload::Acknowledgement, true)
            .unwrap();
        let outcome = handle.block_until_done();
        assert!(outcome.success);
    }

    #[test]
    fn connect_to_unknown_address_fails() {
        let network = LoopbackNetwork::new();
        let a = network.create_transport(addr(1));
        assert!(a.connect(&addr(99)).is_err());
    }

    #[test]
    fn simulated_disconnect_fires_the_callback_with_recorded_type() {
        let network = LoopbackNetwork::new();
        let a = network.create_transport(addr(1));
        let _b = network.create_transport(addr(2));
        a.mark_established(&addr(2), NodeType::Storage);

        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        a.on_connection_lost(Box::new(move |who, ty| {
            *seen2.lock().unwrap() = Some((who, ty));
        }));
        network.sever(&addr(1), &addr(2));
        let (who, ty) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(who, addr(2));
        assert_eq!(ty, Some(NodeType::Storage));
    }

    /// Smoke test that a `ControllerNode` wired to a `LoopbackTransport`
    /// can go through startup join as the sole configured controller.
    #[test]
    fn sole_controller_startup_becomes_primary() {
        let network = LoopbackNetwork::new();
        let self_addr = addr(1);
        let transport = network.create_transport(self_addr.clone());
        let settings = crate::config::ControllerSettings {
            connection_string: self_addr.connection_name(),
            node_name: self_addr.hostname.clone(),
            port: self_addr.port,
            log_level: "info".to_string(),
            max_chunk_item_count: 1000,
            redundant_nodes_per_location: 1,
            web_interface_port: 0,
        };
        let node = ControllerNode::new(self_addr.clone(), vec![self_addr.clone()], settings, transport);
        node.install_callbacks();
        node.startup_join().unwrap();
        assert!(node.is_primary());
    }
}
