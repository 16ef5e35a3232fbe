// The transport boundary (§6): the core never opens a socket itself,
// it only ever calls through this trait. A concrete implementation (a
// TCP transport, or the in-memory `LoopbackTransport` used by the test
// suite) supplies connection tracking, framing, and request/response
// correlation.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::message::{Envelope, Payload};
use crate::types::{NodeDefinition, NodeType};
use submerge_base::Error;

/// Shared slot a blocking sender parks on until the demultiplexer fills
/// it in with a correlated response, or the transport gives up on it.
#[derive(Default)]
pub struct PendingSlot {
    result: Mutex<Option<PendingResult>>,
    cvar: Condvar,
}

enum PendingResult {
    Response(Box<Envelope>),
    Failed,
}

impl PendingSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(PendingSlot::default())
    }

    /// Called by the transport's inbound demultiplexer when a response
    /// with a matching `in_response_to` arrives.
    pub fn resolve(&self, response: Envelope) {
        let mut guard = self.result.lock().unwrap();
        if guard.is_none() {
            *guard = Some(PendingResult::Response(Box::new(response)));
            self.cvar.notify_all();
        }
    }

    /// Called by the transport when the underlying connection drops
    /// while a request is outstanding.
    pub fn fail(&self) {
        let mut guard = self.result.lock().unwrap();
        if guard.is_none() {
            *guard = Some(PendingResult::Failed);
            self.cvar.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> SendOutcome {
        let guard = self.result.lock().unwrap();
        let deadline = Instant::now() + timeout;
        let mut guard = guard;
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (g, res) = self.cvar.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if res.timed_out() && guard.is_none() {
                break;
            }
        }
        match guard.take() {
            Some(PendingResult::Response(env)) => SendOutcome {
                success: true,
                response: Some(*env),
            },
            Some(PendingResult::Failed) | None => SendOutcome {
                success: false,
                response: None,
            },
        }
    }
}

/// The result of a completed (or timed-out) blocking request.
pub struct SendOutcome {
    pub success: bool,
    pub response: Option<Envelope>,
}

/// The handle returned by `send_message`/`send_reply`. Suspends the
/// caller via `block_until_done` until a correlated response arrives or
/// the request times out; non-blocking (fire-and-forget) sends resolve
/// immediately with `success: true, response: None`.
pub struct SendHandle {
    slot: Option<Arc<PendingSlot>>,
    timeout: Duration,
}

impl SendHandle {
    pub fn immediate_success() -> Self {
        SendHandle {
            slot: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn immediate_failure() -> Self {
        SendHandle {
            slot: Some(PendingSlot::new()),
            timeout: Duration::ZERO,
        }
        .failed_now()
    }

    fn failed_now(self) -> Self {
        if let Some(slot) = &self.slot {
            slot.fail();
        }
        self
    }

    pub fn pending(slot: Arc<PendingSlot>, timeout: Duration) -> Self {
        SendHandle {
            slot: Some(slot),
            timeout,
        }
    }

    pub fn block_until_done(self) -> SendOutcome {
        match self.slot {
            None => SendOutcome {
                success: true,
                response: None,
            },
            Some(slot) => slot.wait(self.timeout),
        }
    }
}

/// Callback invoked for every inbound envelope that is not itself a
/// correlated response (i.e. every unsolicited message and every
/// request awaiting a reply from us).
pub type MessageCallback = Box<dyn Fn(NodeDefinition, Envelope) + Send + Sync>;
/// Callback invoked when a link closes. `node_type` is `None` if the
/// peer never completed its join handshake.
pub type ConnectionLostCallback = Box<dyn Fn(NodeDefinition, Option<NodeType>) + Send + Sync>;

/// The transport interface consumed by the controller core (§6). The
/// core is generic over this trait; it never depends on a concrete
/// socket implementation.
pub trait Transport: Send + Sync {
    fn send_message(
        &self,
        addr: &NodeDefinition,
        payload: Payload,
        waiting_for_response: bool,
    ) -> Result<SendHandle, Error>;

    fn send_reply(
        &self,
        request: &Envelope,
        payload: Payload,
        waiting_for_response: bool,
    ) -> Result<SendHandle, Error>;

    fn on_message_received(&self, cb: MessageCallback);
    fn on_connection_lost(&self, cb: ConnectionLostCallback);

    fn rename(&self, old_addr: &NodeDefinition, new_addr: &NodeDefinition);
    fn has_peer(&self, addr: &NodeDefinition) -> bool;
    fn list_peers(&self) -> Vec<(NodeDefinition, Option<NodeType>)>;
    fn mark_established(&self, addr: &NodeDefinition, node_type: NodeType);

    /// Opens a new outbound connection if one does not already exist.
    /// Used by startup join and by the reconciler (§4.5). Connecting to
    /// an address already in the peer table is a no-op success.
    fn connect(&self, addr: &NodeDefinition) -> Result<(), Error>;
}
