use crate::types::{Address, Rank, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Metadata carried with every log entry.
///
/// `streams` is the set of logical streams the entry belongs to; an empty
/// set marks a broadcast entry, visible to every stream cursor (deferred
/// transactions use this). `logical` maps each stream to its per-stream
/// logical address. `commit` is the durability bit flipped by the second
/// phase of the replicated write; readers treat uncommitted entries as
/// unwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub streams: BTreeSet<StreamId>,
    pub rank: Rank,
    pub logical: BTreeMap<StreamId, Address>,
    pub commit: bool,
}

impl EntryMetadata {
    pub fn unscoped() -> Self {
        Self {
            streams: BTreeSet::new(),
            rank: Rank::default(),
            logical: BTreeMap::new(),
            commit: false,
        }
    }

    pub fn for_stream(stream: StreamId, logical: Address) -> Self {
        let mut metadata = Self::unscoped();
        metadata.streams.insert(stream);
        metadata.logical.insert(stream, logical);
        metadata
    }

    /// Tags the entry with several streams at once, without logical
    /// addresses. Multi-stream transaction entries use this form.
    pub fn for_streams(streams: impl IntoIterator<Item = StreamId>) -> Self {
        let mut metadata = Self::unscoped();
        metadata.streams.extend(streams);
        metadata
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    pub fn contains_stream(&self, stream: &StreamId) -> bool {
        self.streams.contains(stream)
    }

    /// Broadcast entries carry no stream tags and are delivered to every
    /// cursor.
    pub fn is_broadcast(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Payload plus metadata stored at one address. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub metadata: EntryMetadata,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(metadata: EntryMetadata, payload: Vec<u8>) -> Self {
        Self { metadata, payload }
    }
}
