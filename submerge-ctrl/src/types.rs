// Core value types shared by every component of the controller: node
// addressing, peer classification, and the chunk-boundary algebra.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// An immutable `(hostname, port)` pair. Equality and ordering are
/// structural; `connection_name()` is the canonical `"hostname:port"`
/// string used as the tie-breaking total order in leader election.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub hostname: String,
    pub port: u16,
}

impl NodeDefinition {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        NodeDefinition {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn connection_name(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Parses a single `host:port` entry, as found (comma-separated) in a
    /// `ConnectionString`.
    pub fn parse(s: &str) -> Result<Self, submerge_base::Error> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| submerge_base::err(format!("not a host:port pair: {s:?}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| submerge_base::err(format!("invalid port in {s:?}")))?;
        Ok(NodeDefinition::new(host, port))
    }
}

impl fmt::Display for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.connection_name())
    }
}

/// The classified role of a peer, assigned only once its join handshake
/// succeeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Controller,
    Query,
    Storage,
    Api,
    Console,
}

/// A total-ordered bound on a key range. `Start` sorts before every
/// `Value`, `End` sorts after every `Value`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChunkMarker {
    Start,
    Value(String),
    End,
}

impl ChunkMarker {
    fn rank(&self) -> u8 {
        match self {
            ChunkMarker::Start => 0,
            ChunkMarker::Value(_) => 1,
            ChunkMarker::End => 2,
        }
    }
}

impl PartialOrd for ChunkMarker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkMarker {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChunkMarker::Value(a), ChunkMarker::Value(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// A half-open key range `[start, end)` owned by exactly one storage node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChunkDefinition {
    pub start: ChunkMarker,
    pub end: ChunkMarker,
    pub owner: NodeDefinition,
}

impl ChunkDefinition {
    /// Builds a chunk, enforcing the `start < end` invariant from the data
    /// model: callers constructing a chunk from unvalidated input (peer
    /// messages) must go through this rather than the struct literal.
    pub fn new(start: ChunkMarker, end: ChunkMarker, owner: NodeDefinition) -> Result<Self, submerge_base::Error> {
        if start >= end {
            return Err(submerge_base::err("chunk start must precede end"));
        }
        Ok(ChunkDefinition { start, end, owner })
    }
}

/// Lifecycle state of a single peer connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PeerState {
    Handshaking,
    Established,
    Closed,
}

/// A peer as tracked by the registry: its address, its classified type
/// (unset while handshaking), and its lifecycle state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Peer {
    pub address: NodeDefinition,
    pub node_type: Option<NodeType>,
    pub state: PeerState,
}
