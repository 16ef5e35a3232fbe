//! The controller plane: membership, leader election, peer admission,
//! and the cluster's chunk map. See `SPEC_FULL.md` at the workspace
//! root for the full design; this crate implements the core state
//! machine against the `Transport` trait in `transport.rs`.

pub mod broadcast;
pub mod chunkmap;
pub mod config;
pub mod election;
pub mod join;
pub mod message;
pub mod node;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod transport;
pub mod types;

pub use chunkmap::ChunkMap;
pub use config::ControllerSettings;
pub use message::{Envelope, MessageIdAllocator, Payload};
pub use node::ControllerNode;
pub use registry::PeerRegistry;
pub use transport::{SendHandle, SendOutcome, Transport};
pub use types::{ChunkDefinition, ChunkMarker, NodeDefinition, NodeType, Peer, PeerState};

#[cfg(test)]
pub mod test_support;

#[cfg(test)]
mod scenarios;
