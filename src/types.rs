use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position in the global append-only log. Allocated once by the sequencer,
/// never reused.
pub type Address = u64;

/// Stable identity of a logical stream multiplexed onto the shared log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Stable hash used for layer-1 placement. Derived from the leading
    /// bytes of the identifier so every process routes the same stream to
    /// the same node.
    pub fn route_hash(&self) -> u64 {
        let bytes = self.0.as_bytes();
        u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Write-ordering tie-break used during recovery. A provisional slot may be
/// superseded only by a strictly higher rank.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Rank(pub u64);

/// Replay/log position marker, totally ordered within one stream.
///
/// `BeforeAll` is the position of an unopened stream, `Latest` the
/// distinguished "sync to tail" request. Variant order gives the total
/// order: `BeforeAll < Position(_) < Latest`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Timestamp {
    BeforeAll,
    Position(Address),
    Latest,
}

impl Timestamp {
    pub fn position(self) -> Option<Address> {
        match self {
            Timestamp::Position(address) => Some(address),
            _ => None,
        }
    }

    /// The position immediately preceding `address`, saturating into
    /// `BeforeAll` at the log head.
    pub fn before(address: Address) -> Self {
        match address.checked_sub(1) {
            Some(previous) => Timestamp::Position(previous),
            None => Timestamp::BeforeAll,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timestamp::BeforeAll => write!(f, "before-all"),
            Timestamp::Position(address) => write!(f, "{address}"),
            Timestamp::Latest => write!(f, "latest"),
        }
    }
}
