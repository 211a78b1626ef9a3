//! Write-once address space: the per-node storage contract for one range of
//! the physical log. A node stores at most one entry per address, ever.

mod memory;

pub use memory::{InMemoryLogUnit, InMemoryLogUnitOptions};

use crate::entry::{EntryMetadata, LogEntry};
use crate::types::{Address, StreamId};
use thiserror::Error;

/// Outcome of a single-node write. Decisive outcomes are values, not errors:
/// the replication layer decides how each one propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The slot was empty (or superseded by rank) and now holds this entry,
    /// provisionally, with the commit bit still clear.
    Accepted,
    /// The address already holds an entry or a filled hole.
    Overwrite,
    /// The address is at or below the node's trim mark.
    Trimmed,
    /// Node capacity exhausted.
    OutOfSpace,
    /// The address does not belong to the sub-log this node serves.
    SubLog,
}

/// Outcome of a single-node read. An entry is returned with its metadata as
/// stored, commit bit included; commit gating is the replication layer's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(LogEntry),
    /// The address was resolved as a permanent no-op placeholder.
    FilledHole,
    /// Nothing written and no hole marker. Transient.
    Unwritten,
    Trimmed,
}

/// Target of a commit-bit update: physical address on layer-0 nodes,
/// stream-logical address on layer-1 nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTarget {
    Address(Address),
    Stream(StreamId, Address),
}

/// Capability surface of one log-unit node. Backends (in-memory, network,
/// cache-backed) are interchangeable behind this trait and selected through
/// the protocol registry.
pub trait LogUnit: Send + Sync {
    fn write(
        &self,
        address: Address,
        metadata: EntryMetadata,
        payload: Vec<u8>,
    ) -> Result<WriteOutcome, LogUnitError>;

    fn read(&self, address: Address) -> Result<ReadOutcome, LogUnitError>;

    /// Layer-1 lookup keyed by (stream, logical address).
    fn read_stream(&self, stream: StreamId, logical: Address) -> Result<ReadOutcome, LogUnitError>;

    /// Idempotently resolves an unwritten address as a permanent no-op
    /// placeholder. Never clobbers real data; a race with a concurrent
    /// write leaves exactly one winner.
    fn fill_hole(&self, address: Address) -> Result<(), LogUnitError>;

    /// Advances the trim mark. Addresses at or below it become permanently
    /// unreadable and unwritable.
    fn trim(&self, address: Address) -> Result<(), LogUnitError>;

    /// Flips the commit bit on a previously written entry.
    fn set_commit(&self, target: CommitTarget, committed: bool) -> Result<(), LogUnitError>;

    /// Lowest currently valid address.
    fn query_head(&self) -> Result<Address, LogUnitError>;

    /// Highest written address (head when nothing is written).
    fn query_tail(&self) -> Result<Address, LogUnitError>;

    /// Operator wipe, stamping a new epoch.
    fn reset(&self, epoch: u64) -> Result<(), LogUnitError>;

    fn ping(&self) -> bool;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogUnitError {
    /// Node unreachable or backend failure with unknown outcome. The caller
    /// must treat this as neither success nor failure.
    #[error("log unit unavailable: {0}")]
    Unavailable(String),
    /// Commit-bit update addressed a slot that holds nothing.
    #[error("no entry at {0:?} to update")]
    UnknownSlot(Address),
    #[error("no entry indexed for stream {stream} at logical address {logical}")]
    UnknownStreamSlot { stream: StreamId, logical: Address },
}
