use super::{CommitTarget, LogUnit, LogUnitError, ReadOutcome, WriteOutcome};
use crate::entry::{EntryMetadata, LogEntry};
use crate::types::{Address, StreamId};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Data(LogEntry),
    Hole,
}

#[derive(Debug, Default)]
struct UnitState {
    slots: BTreeMap<Address, Slot>,
    stream_index: HashMap<(StreamId, Address), Address>,
    trim_mark: Option<Address>,
    epoch: u64,
}

/// Tuning knobs for an in-memory node.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogUnitOptions {
    /// Maximum number of live slots before writes report `OutOfSpace`.
    pub capacity: Option<usize>,
    /// Physical address range this node serves; writes outside it report
    /// `SubLog` (multi-tenancy misrouting).
    pub served_range: Option<Range<Address>>,
}

/// A single write-once node held entirely in memory. The write-once check is
/// atomic per address: all mutation goes through one `RwLock` write guard.
#[derive(Debug, Default)]
pub struct InMemoryLogUnit {
    state: RwLock<UnitState>,
    options: InMemoryLogUnitOptions,
}

impl InMemoryLogUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: InMemoryLogUnitOptions) -> Self {
        Self {
            state: RwLock::new(UnitState::default()),
            options,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    fn trimmed(state: &UnitState, address: Address) -> bool {
        state.trim_mark.is_some_and(|mark| address <= mark)
    }
}

impl LogUnit for InMemoryLogUnit {
    fn write(
        &self,
        address: Address,
        metadata: EntryMetadata,
        payload: Vec<u8>,
    ) -> Result<WriteOutcome, LogUnitError> {
        if let Some(range) = &self.options.served_range {
            if !range.contains(&address) {
                warn!("event=logunit_sublog address={address} range={range:?}");
                return Ok(WriteOutcome::SubLog);
            }
        }
        let mut state = self.state.write();
        if Self::trimmed(&state, address) {
            return Ok(WriteOutcome::Trimmed);
        }
        match state.slots.get(&address) {
            Some(Slot::Hole) => return Ok(WriteOutcome::Overwrite),
            Some(Slot::Data(existing)) => {
                // Rank tie-break during recovery: a provisional slot loses to
                // a strictly higher rank; committed data never does.
                if !existing.metadata.commit && metadata.rank > existing.metadata.rank {
                    info!(
                        "event=logunit_rank_supersede address={address} old_rank={:?} new_rank={:?}",
                        existing.metadata.rank, metadata.rank
                    );
                } else {
                    return Ok(WriteOutcome::Overwrite);
                }
            }
            None => {
                if let Some(capacity) = self.options.capacity {
                    if state.slots.len() >= capacity {
                        return Ok(WriteOutcome::OutOfSpace);
                    }
                }
            }
        }
        let mut metadata = metadata;
        // Writes land provisional; only `set_commit` makes them final.
        metadata.commit = false;
        // First mapping wins; a logical slot never silently moves to a
        // different physical address.
        for (stream, logical) in &metadata.logical {
            state.stream_index.entry((*stream, *logical)).or_insert(address);
        }
        state.slots.insert(address, Slot::Data(LogEntry::new(metadata, payload)));
        debug!("event=logunit_write address={address}");
        Ok(WriteOutcome::Accepted)
    }

    fn read(&self, address: Address) -> Result<ReadOutcome, LogUnitError> {
        let state = self.state.read();
        if Self::trimmed(&state, address) {
            return Ok(ReadOutcome::Trimmed);
        }
        Ok(match state.slots.get(&address) {
            Some(Slot::Data(entry)) => ReadOutcome::Data(entry.clone()),
            Some(Slot::Hole) => ReadOutcome::FilledHole,
            None => ReadOutcome::Unwritten,
        })
    }

    fn read_stream(&self, stream: StreamId, logical: Address) -> Result<ReadOutcome, LogUnitError> {
        let address = {
            let state = self.state.read();
            state.stream_index.get(&(stream, logical)).copied()
        };
        match address {
            Some(address) => self.read(address),
            None => Ok(ReadOutcome::Unwritten),
        }
    }

    fn fill_hole(&self, address: Address) -> Result<(), LogUnitError> {
        let mut state = self.state.write();
        if Self::trimmed(&state, address) {
            return Ok(());
        }
        match state.slots.get(&address) {
            // Real data always wins the race; the fill quietly loses.
            Some(Slot::Data(_)) | Some(Slot::Hole) => {}
            None => {
                state.slots.insert(address, Slot::Hole);
                info!("event=logunit_fill_hole address={address}");
            }
        }
        Ok(())
    }

    fn trim(&self, address: Address) -> Result<(), LogUnitError> {
        let mut state = self.state.write();
        let mark = state.trim_mark.map_or(address, |mark| mark.max(address));
        state.trim_mark = Some(mark);
        let retained = state.slots.split_off(&(mark.saturating_add(1)));
        let reclaimed = state.slots.len();
        state.slots = retained;
        state
            .stream_index
            .retain(|_, physical| *physical > mark);
        info!("event=logunit_trim mark={mark} reclaimed={reclaimed}");
        Ok(())
    }

    fn set_commit(&self, target: CommitTarget, committed: bool) -> Result<(), LogUnitError> {
        let mut state = self.state.write();
        let address = match target {
            CommitTarget::Address(address) => address,
            CommitTarget::Stream(stream, logical) => state
                .stream_index
                .get(&(stream, logical))
                .copied()
                .ok_or(LogUnitError::UnknownStreamSlot { stream, logical })?,
        };
        match state.slots.get_mut(&address) {
            Some(Slot::Data(entry)) => {
                entry.metadata.commit = committed;
                debug!("event=logunit_set_commit address={address} committed={committed}");
                Ok(())
            }
            // Holes are implicitly committed; flipping the bit is a no-op.
            Some(Slot::Hole) => Ok(()),
            None => Err(LogUnitError::UnknownSlot(address)),
        }
    }

    fn query_head(&self) -> Result<Address, LogUnitError> {
        let state = self.state.read();
        Ok(state.trim_mark.map_or(0, |mark| mark.saturating_add(1)))
    }

    fn query_tail(&self) -> Result<Address, LogUnitError> {
        let state = self.state.read();
        Ok(state
            .slots
            .keys()
            .next_back()
            .copied()
            .unwrap_or_else(|| state.trim_mark.map_or(0, |mark| mark.saturating_add(1))))
    }

    fn reset(&self, epoch: u64) -> Result<(), LogUnitError> {
        let mut state = self.state.write();
        *state = UnitState {
            epoch,
            ..UnitState::default()
        };
        info!("event=logunit_reset epoch={epoch}");
        Ok(())
    }

    fn ping(&self) -> bool {
        true
    }
}
