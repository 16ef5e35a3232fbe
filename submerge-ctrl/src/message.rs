// Message identity, the payload catalogue, and the envelope framing
// described in the external-interfaces section: `id | inResponseTo |
// waitingForResponse | payload` in little-endian, payload encoded with
// rmp-serde so individual message shapes stay opaque to the transport.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{ChunkDefinition, NodeDefinition, NodeType};

/// Allocates unique, monotonically increasing message IDs, skipping zero
/// (zero is reserved for "no response"). One instance per process.
#[derive(Debug, Default)]
pub struct MessageIdAllocator(AtomicU32);

impl MessageIdAllocator {
    pub fn new() -> Self {
        MessageIdAllocator(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
            // The counter wrapped exactly onto zero; spin once more.
        }
    }
}

/// Settings exchanged during a `JoinAttempt`, compared field-by-field
/// depending on the joiner's declared type (see join.rs).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JoinSettings {
    pub connection_string: String,
    pub max_chunk_item_count: u32,
    pub redundant_nodes_per_location: u32,
}

/// Result code for a proxied `DataOperation`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataOperationStatus {
    Ok,
    FailedMessage,
}

/// The catalogue of semantic message shapes the core addresses payloads
/// by. Individual field encodings beyond this enum are opaque to the
/// core (query/storage/API payload blobs pass through as `Vec<u8>`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    JoinAttempt {
        node_type: NodeType,
        name: String,
        port: u16,
        settings: JoinSettings,
        is_primary_claim: bool,
    },
    JoinSuccess {
        primary_controller: bool,
        max_chunk_item_count: Option<u32>,
    },
    JoinFailure {
        reason: String,
    },
    Acknowledgement,
    VotingRequest,
    VotingResponse {
        answer: bool,
    },
    LastPrimaryMessageIdRequest,
    LastPrimaryMessageIdResponse {
        last_primary_message_id: u32,
    },
    PrimaryAnnouncement {
        primary: NodeDefinition,
    },
    ChunkListUpdate {
        chunks: Vec<ChunkDefinition>,
    },
    ChunkSplit {
        start1: crate::types::ChunkMarker,
        end1: crate::types::ChunkMarker,
        start2: crate::types::ChunkMarker,
        end2: crate::types::ChunkMarker,
    },
    ChunkMerge {
        start: crate::types::ChunkMarker,
        end: crate::types::ChunkMarker,
    },
    DataOperation {
        body: Vec<u8>,
    },
    DataOperationResult {
        status: DataOperationStatus,
        detail: String,
    },
    NodeList {
        node_type: NodeType,
        nodes: Vec<NodeDefinition>,
    },
    DatabaseCreate,
    DatabaseCreateFailure {
        reason: String,
    },
}

/// The concrete, on-the-wire counterpart of "Message identity": every
/// transport message carries a unique `id`, an `in_response_to` (0 if
/// unsolicited), and a `waiting_for_response` flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u32,
    pub in_response_to: u32,
    pub waiting_for_response: bool,
    pub payload: Payload,
}

impl Envelope {
    /// Encodes `id(u32 LE) | in_response_to(u32 LE) | waiting_for_response(u8)
    /// | payload(rmp-serde bytes)`, matching the external interface exactly.
    pub fn encode(&self) -> Result<Vec<u8>, submerge_base::Error> {
        let payload_bytes = rmp_serde::to_vec(&self.payload)?;
        let mut buf = Vec::with_capacity(9 + payload_bytes.len());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.in_response_to.to_le_bytes());
        buf.push(self.waiting_for_response as u8);
        buf.extend_from_slice(&payload_bytes);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, submerge_base::Error> {
        if buf.len() < 9 {
            return Err(submerge_base::err("envelope shorter than header"));
        }
        let id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let in_response_to = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let waiting_for_response = buf[8] != 0;
        let payload: Payload = rmp_serde::from_slice(&buf[9..])?;
        Ok(Envelope {
            id,
            in_response_to,
            waiting_for_response,
            payload,
        })
    }
}
