//! Logical streams multiplexed onto the shared physical log. A stream is an
//! ordered, resumable view over the entries tagged with its identifier.

mod holefill;

pub use holefill::{HoleFillDecision, HoleFillPolicy, TimeoutHoleFillConfig, TimeoutHoleFillPolicy};

use crate::entry::{EntryMetadata, LogEntry};
use crate::logunit::ReadOutcome;
use crate::replication::{ChainReplication, ReadTarget, ReplicationError};
use crate::sequencer::{Sequencer, SequencerError};
use crate::types::{Address, Rank, StreamId, Timestamp};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// An entry as observed through a stream cursor, with the physical address
/// it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub address: Address,
    pub entry: LogEntry,
}

#[derive(Debug, Error)]
pub enum StreamError {
    /// The cursor hit an allocated but unresolved address. Retryable via a
    /// hole-fill policy.
    #[error("hole encountered at address {address}")]
    HoleEncountered { address: Address },
    /// The cursor is past every issued address; nothing further to read yet.
    #[error("end of stream at address {cursor}")]
    EndOfStream { cursor: Address },
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

/// One logical stream bound to a sequencer and a replication chain.
///
/// The read cursor is exclusively owned by this handle; opening the same
/// identifier again yields an independent cursor. Logical addresses are
/// issued by the sequencer, so every handle on a stream appends into one
/// shared logical sequence.
pub struct LogStream {
    id: StreamId,
    sequencer: Arc<dyn Sequencer>,
    chain: Arc<ChainReplication>,
    cursor: Mutex<Address>,
}

impl LogStream {
    pub fn open(
        id: StreamId,
        sequencer: Arc<dyn Sequencer>,
        chain: Arc<ChainReplication>,
    ) -> Self {
        Self {
            id,
            sequencer,
            chain,
            cursor: Mutex::new(0),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn chain(&self) -> &Arc<ChainReplication> {
        &self.chain
    }

    pub fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }

    /// Appends a payload tagged with this stream: reserves an address,
    /// replicates, and returns the resulting log position.
    pub fn append(&self, payload: Vec<u8>) -> Result<Timestamp, StreamError> {
        self.append_with_rank(payload, Rank::default())
    }

    pub fn append_with_rank(
        &self,
        payload: Vec<u8>,
        rank: Rank,
    ) -> Result<Timestamp, StreamError> {
        let reservation = self.sequencer.reserve_stream(self.id, 1)?;
        let metadata =
            EntryMetadata::for_stream(self.id, reservation.logical).with_rank(rank);
        self.chain.write(reservation.address, metadata, payload)?;
        debug!(
            "event=stream_append stream={} address={} logical={}",
            self.id, reservation.address, reservation.logical
        );
        Ok(Timestamp::Position(reservation.address))
    }

    /// Pre-allocates `count` addresses for this stream without writing.
    /// Deliberately leaves holes in the log (flow control, tests).
    pub fn reserve(&self, count: u64) -> Result<Address, StreamError> {
        Ok(self.sequencer.reserve(count)?)
    }

    /// Advances the cursor to the next entry tagged with this stream (or
    /// broadcast), up to the sequencer tail. Signals `HoleEncountered` at
    /// the first unresolved address and leaves the cursor there, so the
    /// caller can apply a hole-fill policy and re-read.
    pub fn read_next_entry(&self) -> Result<StreamEntry, StreamError> {
        self.read_next_entry_upto(Address::MAX)
    }

    /// Like `read_next_entry` but never advances past `bound`.
    pub fn read_next_entry_upto(&self, bound: Address) -> Result<StreamEntry, StreamError> {
        let mut cursor = self.cursor.lock();
        let issued = match self.sequencer.current()? {
            Timestamp::Position(last) => last,
            _ => return Err(StreamError::EndOfStream { cursor: *cursor }),
        };
        let limit = bound.min(issued);
        while *cursor <= limit {
            let address = *cursor;
            match self.chain.read(ReadTarget::Physical(address))? {
                ReadOutcome::Unwritten => {
                    // Allocated but unresolved: a hole. The cursor stays put
                    // until the position resolves.
                    return Err(StreamError::HoleEncountered { address });
                }
                ReadOutcome::FilledHole | ReadOutcome::Trimmed => {
                    *cursor = address + 1;
                }
                ReadOutcome::Data(entry) => {
                    *cursor = address + 1;
                    if entry.metadata.contains_stream(&self.id) || entry.metadata.is_broadcast() {
                        return Ok(StreamEntry { address, entry });
                    }
                }
            }
        }
        Err(StreamError::EndOfStream { cursor: *cursor })
    }

    /// Reads the next entry, resolving holes through `policy`. Loops until
    /// an entry, end-of-stream, or a non-hole error surfaces.
    pub fn read_next_entry_with(
        &self,
        policy: &mut dyn HoleFillPolicy,
    ) -> Result<StreamEntry, StreamError> {
        loop {
            match self.read_next_entry() {
                Err(StreamError::HoleEncountered { address }) => {
                    match policy.apply(address, self)? {
                        HoleFillDecision::Deferred(wait) => std::thread::sleep(wait),
                        HoleFillDecision::Filled => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Replicated hole fill at `address`, on behalf of a hole-fill policy.
    pub fn fill_hole(&self, address: Address) -> Result<(), StreamError> {
        Ok(self.chain.fill_hole(address)?)
    }

    /// The physical position of the cursor (next address to examine).
    pub fn cursor_position(&self) -> Address {
        *self.cursor.lock()
    }
}
