//! TCP transport for the controller plane (§4.0/§5/§6): one TCP
//! connection per peer, a length-prefixed frame around each
//! [`Envelope`], and a worker pool draining a single inbox so a
//! handler's own nested blocking request never stalls the reader
//! thread it depends on. Generalizes the older byte-queue multiplexer
//! this crate used to carry into a concrete [`Transport`](submerge_ctrl::Transport).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use submerge_base::{err, Error};
use submerge_ctrl::transport::{ConnectionLostCallback, MessageCallback, PendingSlot};
use submerge_ctrl::{Envelope, MessageIdAllocator, NodeDefinition, NodeType, Payload, PeerRegistry, SendHandle, Transport};

/// How many worker threads drain the shared inbox. More than one is
/// required: a handler answering one request (e.g. a join handshake)
/// commonly issues its own blocking request to a third party and must
/// not starve the rest of the node's traffic while it waits.
const WORKER_THREADS: usize = 8;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames above this are refused outright rather than allocating a
/// buffer for whatever a misbehaving or corrupt peer claims its length
/// prefix is.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), Error> {
    let len = bytes.len() as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}

/// Reads one length-prefixed frame. `Ok(None)` means the peer closed
/// the connection cleanly between frames.
fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, Error> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(err(format!("frame of {len} bytes exceeds the maximum")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// One live socket. `current_addr` tracks the peer's identity as it
/// moves from its ephemeral connect-time address to the canonical one
/// it declares during join (§4.1), so in-flight reads keep tagging
/// inbound envelopes correctly across a `rename`.
struct Connection {
    current_addr: Mutex<NodeDefinition>,
    writer: Mutex<TcpStream>,
}

/// A concrete, socket-backed [`Transport`]. One instance per process;
/// `bind` spawns the accept loop and the worker pool and hands back an
/// `Arc` the caller wires into a `ControllerNode`.
pub struct TcpTransport {
    self_addr: NodeDefinition,
    connections: Mutex<HashMap<NodeDefinition, Arc<Connection>>>,
    registry: PeerRegistry,
    pending: Mutex<HashMap<u32, (NodeDefinition, Arc<PendingSlot>)>>,
    /// Which address an inbound envelope with a given id arrived from,
    /// so `send_reply` knows where to send without the core passing
    /// `from` back in. Recorded for every inbound envelope, including
    /// responses: a response can itself demand a correlated reply (a
    /// `JoinSuccess` still waits on its `Acknowledgement`), so whoever
    /// receives it must be able to route one back.
    reply_routes: Mutex<HashMap<u32, NodeDefinition>>,
    id_alloc: MessageIdAllocator,
    message_cb: Mutex<Option<MessageCallback>>,
    lost_cb: Mutex<Option<ConnectionLostCallback>>,
    inbox: Sender<(NodeDefinition, Envelope)>,
    timeout: Duration,
    self_ref: Weak<TcpTransport>,
}

impl TcpTransport {
    /// Binds `bind_addr`, starts accepting inbound connections, and
    /// starts the worker pool. `self_addr` is this node's own canonical
    /// address, used only for logging.
    pub fn bind(self_addr: NodeDefinition, bind_addr: impl ToSocketAddrs) -> Result<Arc<Self>, Error> {
        let listener = TcpListener::bind(bind_addr)?;
        let (tx, rx) = channel::<(NodeDefinition, Envelope)>();

        let transport = Arc::new_cyclic(|weak| TcpTransport {
            self_addr: self_addr.clone(),
            connections: Mutex::new(HashMap::new()),
            registry: PeerRegistry::new(),
            pending: Mutex::new(HashMap::new()),
            reply_routes: Mutex::new(HashMap::new()),
            id_alloc: MessageIdAllocator::new(),
            message_cb: Mutex::new(None),
            lost_cb: Mutex::new(None),
            inbox: tx,
            timeout: DEFAULT_TIMEOUT,
            self_ref: weak.clone(),
        });

        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..WORKER_THREADS {
            let worker = Arc::clone(&transport);
            let worker_rx = Arc::clone(&rx);
            thread::spawn(move || loop {
                let next = { worker_rx.lock().unwrap().recv() };
                match next {
                    Ok((from, env)) => worker.receive(from, env),
                    Err(_) => return,
                }
            });
        }

        let accept_transport = Arc::clone(&transport);
        info!(addr = %self_addr, "listening");
        thread::spawn(move || {
            for incoming in listener.incoming() {
                match incoming {
                    Ok(stream) => {
                        let peer_addr = match stream.peer_addr() {
                            Ok(a) => NodeDefinition::new(a.ip().to_string(), a.port()),
                            Err(e) => {
                                warn!(error = %e, "accepted connection with no peer address");
                                continue;
                            }
                        };
                        handle_connection(Arc::clone(&accept_transport), peer_addr, stream);
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });

        Ok(transport)
    }

    /// This node's own canonical address, as passed to `bind`.
    pub fn self_addr(&self) -> &NodeDefinition {
        &self.self_addr
    }

    fn route(&self, addr: &NodeDefinition, env: Envelope) -> Result<(), Error> {
        let conn = {
            let conns = self.connections.lock().unwrap();
            conns.get(addr).cloned()
        }
        .ok_or_else(|| err(format!("no connection to {addr}")))?;
        let bytes = env.encode()?;
        let mut stream = conn.writer.lock().unwrap();
        write_frame(&mut stream, &bytes)
    }

    fn receive(&self, from: NodeDefinition, env: Envelope) {
        self.reply_routes.lock().unwrap().insert(env.id, from.clone());
        if env.in_response_to != 0 {
            let slot = self.pending.lock().unwrap().remove(&env.in_response_to).map(|(_, s)| s);
            if let Some(slot) = slot {
                slot.resolve(env);
            }
            // No matching pending slot (the request already timed out):
            // the response is simply dropped.
            return;
        }
        if let Some(cb) = self.message_cb.lock().unwrap().as_ref() {
            cb(from, env);
        }
    }

    /// Closes the connection to `addr` as if the underlying socket had
    /// failed, firing the connection-lost callback from this side.
    /// Used on graceful shutdown and by the test suite to simulate a
    /// dropped peer without depending on thread-lifetime races.
    pub fn close(&self, addr: &NodeDefinition) {
        let conn = self.connections.lock().unwrap().get(addr).cloned();
        if let Some(conn) = conn {
            let _ = conn.writer.lock().unwrap().shutdown(std::net::Shutdown::Both);
        }
    }

    fn handle_disconnect(&self, conn: &Connection) {
        let addr = conn.current_addr.lock().unwrap().clone();
        self.connections.lock().unwrap().remove(&addr);
        let peer = self.registry.close(&addr);
        let node_type = peer.and_then(|p| p.node_type);

        let stale: Vec<u32> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .filter(|(_, (target, _))| target == &addr)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut pending = self.pending.lock().unwrap();
        for id in stale {
            if let Some((_, slot)) = pending.remove(&id) {
                slot.fail();
            }
        }
        drop(pending);

        info!(peer = %addr, "connection lost");
        if let Some(cb) = self.lost_cb.lock().unwrap().as_ref() {
            cb(addr, node_type);
        }
    }
}

fn reader_loop(transport: Arc<TcpTransport>, conn: Arc<Connection>, mut stream: TcpStream) {
    loop {
        match read_frame(&mut stream) {
            Ok(Some(buf)) => match Envelope::decode(&buf) {
                Ok(env) => {
                    let from = conn.current_addr.lock().unwrap().clone();
                    if transport.inbox.send((from, env)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed envelope"),
            },
            Ok(None) => {
                transport.handle_disconnect(&conn);
                return;
            }
            Err(e) => {
                warn!(error = %e, "read error, closing connection");
                transport.handle_disconnect(&conn);
                return;
            }
        }
    }
}

/// Registers a freshly accepted or dialed socket and starts its
/// reader thread. `initial_addr` is the key the connection is first
/// reachable under: the peer's ephemeral source address if accepted,
/// the already-canonical address if dialed via `connect`.
fn handle_connection(transport: Arc<TcpTransport>, initial_addr: NodeDefinition, stream: TcpStream) {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cloning accepted stream failed, dropping connection");
            return;
        }
    };
    let conn = Arc::new(Connection {
        current_addr: Mutex::new(initial_addr.clone()),
        writer: Mutex::new(stream),
    });
    transport.registry.record(initial_addr.clone(), None);
    transport.connections.lock().unwrap().insert(initial_addr, Arc::clone(&conn));
    let worker_transport = Arc::clone(&transport);
    thread::spawn(move || reader_loop(worker_transport, conn, reader_stream));
}

impl Transport for TcpTransport {
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
        self.pending.lock().unwrap().insert(id, (addr.clone(), Arc::clone(&slot)));
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
            .ok_or_else(|| err("no known reply route for that request id"))?;
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
        self.pending.lock().unwrap().insert(id, (dest.clone(), Arc::clone(&slot)));
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
        let mut conns = self.connections.lock().unwrap();
        if conns.contains_key(new_addr) {
            // Canonical identity already has a live connection
            // (first-won, see registry::rename): drop the duplicate
            // socket's bookkeeping entirely rather than leave it
            // stranded under its old ephemeral key.
            conns.remove(old_addr);
            return;
        }
        if let Some(conn) = conns.remove(old_addr) {
            *conn.current_addr.lock().unwrap() = new_addr.clone();
            conns.insert(new_addr.clone(), conn);
        }
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
        if self.registry.has(addr) {
            return Ok(());
        }
        let stream = TcpStream::connect(addr.connection_name()).map_err(|e| err(format!("connecting to {addr}: {e}")))?;
        let transport = self
            .self_ref
            .upgrade()
            .ok_or_else(|| err("transport already shut down"))?;
        handle_connection(transport, addr.clone(), stream);
        Ok(())
    }
}
