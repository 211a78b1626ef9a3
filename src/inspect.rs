//! Operator inspection of the raw log. Bypasses commit gating so a human
//! can see provisional writes, holes, and trim marks exactly as the nodes
//! store them. Read-mostly; the two mutating operations (trim, repair) obey
//! the same invariants as the online paths.

use crate::entry::LogEntry;
use crate::logunit::{CommitTarget, LogUnit, LogUnitError, ReadOutcome};
use crate::replication::{ChainReplication, ReplicationError};
use crate::types::Address;
use crate::view::{LayoutError, ViewProvider};
use log::info;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Node(#[from] LogUnitError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error("no segment owns address {0}")]
    NoSegment(Address),
}

/// What one node holds at one address, commit bit and all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReport {
    pub layer: usize,
    pub node: usize,
    pub outcome: ReadOutcome,
}

/// Aggregate head/tail over every node in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeReport {
    pub head: Address,
    pub tail: Address,
}

/// Raw view over the log units behind a layout view.
pub struct LogInspector {
    provider: Arc<dyn ViewProvider>,
}

impl LogInspector {
    pub fn new(provider: Arc<dyn ViewProvider>) -> Self {
        Self { provider }
    }

    /// Reads `address` from every node of its owning segment, ungated.
    /// Disagreement between nodes (one holds data, another a hole) is
    /// exactly what this surface exists to show.
    pub fn slots(&self, address: Address) -> Result<Vec<SlotReport>, InspectError> {
        let view = self.provider.current()?;
        let segment = view
            .segment_for(address)
            .ok_or(InspectError::NoSegment(address))?;
        let mut reports = Vec::new();
        for (layer, nodes) in segment.layers.iter().enumerate() {
            for (node, unit) in nodes.iter().enumerate() {
                reports.push(SlotReport {
                    layer,
                    node,
                    outcome: unit.read(address)?,
                });
            }
        }
        Ok(reports)
    }

    /// Smallest head and largest tail across all nodes of the segment
    /// owning `address`.
    pub fn range(&self, address: Address) -> Result<RangeReport, InspectError> {
        let view = self.provider.current()?;
        let segment = view
            .segment_for(address)
            .ok_or(InspectError::NoSegment(address))?;
        let mut head = Address::MAX;
        let mut tail = 0;
        for unit in segment.layers.iter().flatten() {
            head = head.min(unit.query_head()?);
            tail = tail.max(unit.query_tail()?);
        }
        Ok(RangeReport { head, tail })
    }

    /// Operator trim: advances the trim mark on every node of the owning
    /// segment. Irreversible.
    pub fn trim(&self, address: Address) -> Result<(), InspectError> {
        let view = self.provider.current()?;
        let segment = view
            .segment_for(address)
            .ok_or(InspectError::NoSegment(address))?;
        for unit in segment.layers.iter().flatten() {
            unit.trim(address)?;
        }
        info!("event=inspect_trim address={address} epoch={}", view.epoch);
        Ok(())
    }

    /// Repairs a divergent address: if either routed node holds committed
    /// data, the data is re-propagated to the node missing it; if neither
    /// does, the address is hole-filled on both. The write-once invariant
    /// holds throughout, data is never replaced.
    pub fn repair(&self, address: Address) -> Result<(), InspectError> {
        let view = self.provider.current()?;
        let segment = view
            .segment_for(address)
            .ok_or(InspectError::NoSegment(address))?;
        let first = ChainReplication::layer0_node(segment, address);
        // Layer-1 routing is keyed off the entry's first stream, which only
        // the stored data can tell us.
        let stored = match first.read(address)? {
            ReadOutcome::Data(entry) => Some(entry),
            _ => None,
        };
        let first_stream = stored
            .as_ref()
            .and_then(|entry| entry.metadata.streams.iter().next().copied());
        let second = ChainReplication::layer1_node(segment, first_stream.as_ref(), address);

        let committed = [first, second]
            .into_iter()
            .find_map(|unit| match unit.read(address) {
                Ok(ReadOutcome::Data(entry)) if entry.metadata.commit => Some(entry),
                _ => None,
            });
        match committed {
            Some(entry) => {
                for unit in [first, second] {
                    match unit.read(address)? {
                        ReadOutcome::Unwritten => {
                            unit.write(address, entry.metadata.clone(), entry.payload.clone())?;
                            self.commit_on(unit.as_ref(), address, &entry)?;
                        }
                        ReadOutcome::Data(stored) if !stored.metadata.commit => {
                            // Same payload already replicated, only the
                            // commit bit is missing.
                            self.commit_on(unit.as_ref(), address, &entry)?;
                        }
                        _ => {}
                    }
                }
                info!("event=inspect_repair address={address} mode=propagate");
            }
            None => {
                first.fill_hole(address)?;
                second.fill_hole(address)?;
                info!("event=inspect_repair address={address} mode=hole_fill");
            }
        }
        Ok(())
    }

    fn commit_on(
        &self,
        unit: &dyn LogUnit,
        address: Address,
        entry: &LogEntry,
    ) -> Result<(), InspectError> {
        unit.set_commit(CommitTarget::Address(address), true)?;
        for (stream, logical) in &entry.metadata.logical {
            // Stream-indexed commit only applies where the stream index
            // exists; unknown-slot responses are expected on layer 0.
            match unit.set_commit(CommitTarget::Stream(*stream, *logical), true) {
                Ok(()) | Err(LogUnitError::UnknownStreamSlot { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
