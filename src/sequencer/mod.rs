//! Global ordering service: issues unique, monotonically increasing log
//! addresses. The sole source of total order for the shared log.

mod memory;

pub use memory::InMemorySequencer;

use crate::types::{Address, StreamId, Timestamp};
use thiserror::Error;

/// A block reserved on behalf of one stream: the first physical address and
/// the stream's first logical address for the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReservation {
    pub address: Address,
    pub logical: Address,
}

/// Capability surface of a sequencer backend.
///
/// Backends serve unbounded concurrent callers; reservation blocks returned
/// by `reserve` are pairwise disjoint and strictly increasing. Gaps only
/// appear through deliberate hole creation downstream, never through the
/// counter itself.
pub trait Sequencer: Send + Sync {
    /// Reserves a contiguous, exclusively-owned block of `count` addresses
    /// and returns its first address.
    fn reserve(&self, count: u64) -> Result<Address, SequencerError>;

    /// Reserves `count` addresses tagged to `stream` and advances the
    /// stream's logical tail by the same amount. Logical addresses are
    /// issued here, not by clients, so every handle on a stream shares one
    /// logical sequence and logical order matches physical order.
    fn reserve_stream(
        &self,
        stream: StreamId,
        count: u64,
    ) -> Result<StreamReservation, SequencerError>;

    /// The last issued address, or `Timestamp::BeforeAll` when nothing has
    /// been issued yet.
    fn current(&self) -> Result<Timestamp, SequencerError>;

    /// Post-failover reset: the counter becomes
    /// `max(current, last_known + 1)` so recovery never re-issues an address
    /// that may already hold a write.
    fn recover(&self, last_known: Address) -> Result<(), SequencerError>;

    /// Liveness probe against the backing counter.
    fn ping(&self) -> bool;

    /// Operator reset of the counter and all stream tails to zero. Destroys
    /// ordering history; only valid on a fresh or wiped log.
    fn reset(&self) -> Result<(), SequencerError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequencerError {
    /// Backing counter unreachable. Retryable.
    #[error("sequencer backend unavailable: {0}")]
    Unavailable(String),
    #[error("reservation count must be nonzero")]
    EmptyReservation,
    #[error("address space exhausted")]
    Exhausted,
}
