// Chunk Map (C2): the authoritative ordered list of chunk definitions.
// Mutated only by the primary; every mutation and every snapshot goes
// through the same lock (§5 "Shared state").

use std::sync::Mutex;
use tracing::warn;

use crate::types::{ChunkDefinition, ChunkMarker, NodeDefinition};

#[derive(Default)]
pub struct ChunkMap {
    chunks: Mutex<Vec<ChunkDefinition>>,
}

impl ChunkMap {
    pub fn new() -> Self {
        ChunkMap::default()
    }

    /// An immutable copy of the current chunk list, taken under the lock.
    pub fn snapshot(&self) -> Vec<ChunkDefinition> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().unwrap().is_empty()
    }

    /// Installs the initial `[Start, End)` chunk when the first storage
    /// node joins and the database is created. Overwrites whatever was
    /// there (only ever called against an empty map).
    pub fn install(&self, owner: NodeDefinition) {
        let mut chunks = self.chunks.lock().unwrap();
        *chunks = vec![ChunkDefinition {
            start: ChunkMarker::Start,
            end: ChunkMarker::End,
            owner,
        }];
    }

    /// Replaces the chunk map wholesale, as done by a non-primary when it
    /// receives a `ChunkListUpdate` broadcast from the primary.
    pub fn replace(&self, chunks: Vec<ChunkDefinition>) {
        *self.chunks.lock().unwrap() = chunks;
    }

    pub fn clear(&self) {
        self.chunks.lock().unwrap().clear();
    }

    /// Removes the chunk whose `start == start1` and installs two new
    /// chunks, `(start1, end1)` and `(start2, end2)`, both owned by
    /// `owner`. Acknowledged unconditionally by the caller regardless of
    /// whether a matching chunk was found (§4.2): absence indicates a
    /// stale view that the next broadcast will reconcile.
    pub fn apply_split(
        &self,
        start1: ChunkMarker,
        end1: ChunkMarker,
        start2: ChunkMarker,
        end2: ChunkMarker,
        owner: NodeDefinition,
    ) {
        let mut chunks = self.chunks.lock().unwrap();
        let before = chunks.len();
        chunks.retain(|c| c.start != start1);
        if chunks.len() == before {
            warn!(start = ?start1, "chunk split targets an absent chunk, acknowledging anyway");
        }
        chunks.push(ChunkDefinition {
            start: start1,
            end: end1,
            owner: owner.clone(),
        });
        chunks.push(ChunkDefinition {
            start: start2,
            end: end2,
            owner,
        });
    }

    /// Removes the two chunks identified independently by `start == start`
    /// and `end == end`, and installs one chunk `(start, end, owner)` in
    /// their place. As with split, acknowledged regardless of whether
    /// either match was found.
    pub fn apply_merge(&self, start: ChunkMarker, end: ChunkMarker, owner: NodeDefinition) {
        let mut chunks = self.chunks.lock().unwrap();
        let had_start = chunks.iter().any(|c| c.start == start);
        let had_end = chunks.iter().any(|c| c.end == end);
        if !had_start || !had_end {
            warn!(?start, ?end, had_start, had_end, "chunk merge targets an absent chunk, acknowledging anyway");
        }
        chunks.retain(|c| c.start != start && c.end != end);
        chunks.push(ChunkDefinition { start, end, owner });
    }

    /// Removes every chunk owned by `node` on storage-peer disconnect.
    /// No replacement is chosen; this can leave a coverage hole until
    /// another storage node reports the relevant range (§9).
    pub fn remove_owner(&self, node: &NodeDefinition) {
        self.chunks.lock().unwrap().retain(|c| &c.owner != node);
    }

    /// Checks the coverage/non-overlap/unique-starts invariants (§3);
    /// used by tests and callable defensively after a broadcast.
    pub fn check_invariants(&self) -> Result<(), submerge_base::Error> {
        let mut chunks = self.chunks.lock().unwrap().clone();
        if chunks.is_empty() {
            return Ok(());
        }
        chunks.sort_by(|a, b| a.start.cmp(&b.start));
        if chunks[0].start != ChunkMarker::Start {
            return Err(submerge_base::err("chunk map does not start at Start"));
        }
        if chunks[chunks.len() - 1].end != ChunkMarker::End {
            return Err(submerge_base::err("chunk map does not end at End"));
        }
        for w in chunks.windows(2) {
            if w[0].end != w[1].start {
                return Err(submerge_base::err("chunk map has a gap or overlap"));
            }
        }
        Ok(())
    }
}
