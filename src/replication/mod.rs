//! Layered chain replication: composes log-unit nodes into one
//! fault-tolerant logical log with a two-phase (replicate, then commit)
//! write and view-invalidation retries.
//!
//! Placement for a two-layer segment: layer 0 is keyed by
//! `address % |layer0|`, layer 1 by `hash(first stream) % |layer1|`
//! (falling back to the address when the entry carries no streams).

use crate::entry::EntryMetadata;
use crate::logunit::{CommitTarget, LogUnit, LogUnitError, ReadOutcome, WriteOutcome};
use crate::types::{Address, StreamId};
use crate::util::retry::RetryPolicy;
use crate::view::{LayoutError, ResolvedSegment, ViewProvider};
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;

/// What a replicated read is keyed on: the physical address (layer 0) or a
/// stream's logical address (layer 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTarget {
    Physical(Address),
    Stream { stream: StreamId, logical: Address },
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("address {0} already written")]
    Overwrite(Address),
    #[error("address {0} is trimmed")]
    Trimmed(Address),
    #[error("node out of space writing address {0}")]
    OutOfSpace(Address),
    #[error("address {0} misrouted to a different sub-log")]
    SubLog(Address),
    #[error("address {0} unwritten")]
    Unwritten(Address),
    #[error("layout has no segment covering address {0}")]
    NoSegment(Address),
    #[error("view retries exhausted after {attempts} attempts for address {address}: {last}")]
    RetriesExhausted {
        address: Address,
        attempts: usize,
        last: LogUnitError,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Phase of one replicated write. Decisive outcomes complete the machine;
/// node failures fail it, and the caller refreshes the view and restarts
/// from the first phase. Commit bits are only flipped in `Committing`, so a
/// cancelled or failed write never leaves a half-committed entry behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    SendLayer0,
    SendLayer1,
    Committing,
    Done(WriteOutcome),
}

/// Chain replication client over the current layout view.
pub struct ChainReplication {
    provider: Arc<dyn ViewProvider>,
    retry: RetryPolicy,
}

impl ChainReplication {
    pub fn new(provider: Arc<dyn ViewProvider>) -> Self {
        Self::with_retry(provider, RetryPolicy::default())
    }

    pub fn with_retry(provider: Arc<dyn ViewProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Writes `payload` at `address` across the segment's layers and commits
    /// it. On transport failure the cached view is invalidated and the write
    /// restarts against a fresh view, bounded by the retry policy.
    pub fn write(
        &self,
        address: Address,
        metadata: EntryMetadata,
        payload: Vec<u8>,
    ) -> Result<(), ReplicationError> {
        let mut retry = self.retry.handle();
        loop {
            let view = self.provider.current()?;
            let segment = view
                .segment_for(address)
                .ok_or(ReplicationError::NoSegment(address))?;
            match self.drive_write(segment, address, &metadata, &payload) {
                Ok(WriteOutcome::Accepted) => {
                    debug!(
                        "event=chain_write_commit address={address} epoch={} attempts={}",
                        view.epoch,
                        retry.attempts()
                    );
                    return Ok(());
                }
                Ok(outcome) => return Err(Self::decisive(address, outcome)),
                Err(failure) => {
                    warn!(
                        "event=chain_write_retry address={address} epoch={} error={failure}",
                        view.epoch
                    );
                    self.provider.invalidate();
                    match retry.next_delay() {
                        Some(delay) => std::thread::sleep(delay),
                        None => {
                            return Err(ReplicationError::RetriesExhausted {
                                address,
                                attempts: retry.attempts(),
                                last: failure,
                            })
                        }
                    }
                }
            }
        }
    }

    /// Reads through the placement rule and gates on the commit bit: a
    /// written-but-uncommitted entry is reported as unwritten.
    pub fn read(&self, target: ReadTarget) -> Result<ReadOutcome, ReplicationError> {
        let mut retry = self.retry.handle();
        loop {
            let view = self.provider.current()?;
            let attempt = match target {
                ReadTarget::Physical(address) => {
                    let segment = view
                        .segment_for(address)
                        .ok_or(ReplicationError::NoSegment(address))?;
                    Self::layer0_node(segment, address).read(address)
                }
                ReadTarget::Stream { stream, logical } => {
                    let segment = view
                        .segment_for(logical)
                        .ok_or(ReplicationError::NoSegment(logical))?;
                    Self::layer1_node(segment, Some(&stream), logical).read_stream(stream, logical)
                }
            };
            match attempt {
                Ok(ReadOutcome::Data(entry)) if !entry.metadata.commit => {
                    return Ok(ReadOutcome::Unwritten)
                }
                Ok(outcome) => return Ok(outcome),
                Err(failure) => {
                    warn!("event=chain_read_retry target={target:?} error={failure}");
                    self.provider.invalidate();
                    match retry.next_delay() {
                        Some(delay) => std::thread::sleep(delay),
                        None => {
                            let address = match target {
                                ReadTarget::Physical(address) => address,
                                ReadTarget::Stream { logical, .. } => logical,
                            };
                            return Err(ReplicationError::RetriesExhausted {
                                address,
                                attempts: retry.attempts(),
                                last: failure,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Idempotently resolves `address` as a permanent no-op placeholder on
    /// both routed nodes. Safe to race from multiple readers.
    pub fn fill_hole(&self, address: Address) -> Result<(), ReplicationError> {
        let mut retry = self.retry.handle();
        loop {
            let view = self.provider.current()?;
            let segment = view
                .segment_for(address)
                .ok_or(ReplicationError::NoSegment(address))?;
            let first = Self::layer0_node(segment, address);
            let second = Self::layer1_node(segment, None, address);
            match first.fill_hole(address).and_then(|_| second.fill_hole(address)) {
                Ok(()) => {
                    info!("event=chain_fill_hole address={address}");
                    return Ok(());
                }
                Err(failure) => {
                    warn!("event=chain_fill_hole_retry address={address} error={failure}");
                    self.provider.invalidate();
                    match retry.next_delay() {
                        Some(delay) => std::thread::sleep(delay),
                        None => {
                            return Err(ReplicationError::RetriesExhausted {
                                address,
                                attempts: retry.attempts(),
                                last: failure,
                            })
                        }
                    }
                }
            }
        }
    }

    /// Advances the trim mark on every node of the owning segment.
    pub fn trim(&self, address: Address) -> Result<(), ReplicationError> {
        let view = self.provider.current()?;
        let segment = view
            .segment_for(address)
            .ok_or(ReplicationError::NoSegment(address))?;
        for layer in &segment.layers {
            for node in layer {
                if let Err(failure) = node.trim(address) {
                    warn!("event=chain_trim_failed address={address} error={failure}");
                }
            }
        }
        info!("event=chain_trim address={address}");
        Ok(())
    }

    fn drive_write(
        &self,
        segment: &ResolvedSegment,
        address: Address,
        metadata: &EntryMetadata,
        payload: &[u8],
    ) -> Result<WriteOutcome, LogUnitError> {
        let first_stream = metadata.streams.iter().next();
        let first = Self::layer0_node(segment, address);
        let second = Self::layer1_node(segment, first_stream, address);

        let mut phase = WritePhase::SendLayer0;
        loop {
            phase = match phase {
                WritePhase::SendLayer0 => {
                    match first.write(address, metadata.clone(), payload.to_vec())? {
                        WriteOutcome::Accepted => WritePhase::SendLayer1,
                        decisive => WritePhase::Done(decisive),
                    }
                }
                WritePhase::SendLayer1 => {
                    match second.write(address, metadata.clone(), payload.to_vec())? {
                        WriteOutcome::Accepted => WritePhase::Committing,
                        decisive => WritePhase::Done(decisive),
                    }
                }
                WritePhase::Committing => {
                    first.set_commit(CommitTarget::Address(address), true)?;
                    // Entries tagged without logical addresses (and broadcast
                    // entries) have no stream slot to commit through.
                    let target = first_stream
                        .and_then(|stream| metadata.logical.get(stream).map(|l| (*stream, *l)))
                        .map_or(CommitTarget::Address(address), |(stream, logical)| {
                            CommitTarget::Stream(stream, logical)
                        });
                    second.set_commit(target, true)?;
                    WritePhase::Done(WriteOutcome::Accepted)
                }
                WritePhase::Done(outcome) => return Ok(outcome),
            };
        }
    }

    pub(crate) fn layer0_node(segment: &ResolvedSegment, address: Address) -> &Arc<dyn LogUnit> {
        let layer = &segment.layers[0];
        &layer[(address % layer.len() as u64) as usize]
    }

    pub(crate) fn layer1_node<'a>(
        segment: &'a ResolvedSegment,
        stream: Option<&StreamId>,
        address: Address,
    ) -> &'a Arc<dyn LogUnit> {
        let layer = &segment.layers[1];
        let key = stream.map_or(address, |stream| stream.route_hash());
        &layer[(key % layer.len() as u64) as usize]
    }

    fn decisive(address: Address, outcome: WriteOutcome) -> ReplicationError {
        match outcome {
            WriteOutcome::Overwrite => ReplicationError::Overwrite(address),
            WriteOutcome::Trimmed => ReplicationError::Trimmed(address),
            WriteOutcome::OutOfSpace => ReplicationError::OutOfSpace(address),
            WriteOutcome::SubLog => ReplicationError::SubLog(address),
            WriteOutcome::Accepted => unreachable!("accepted is not decisive"),
        }
    }
}
