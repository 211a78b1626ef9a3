use super::variants::PassThroughEngine;
use super::{CommandFrame, EngineCore, FrameKind, SmrError, StateMachine};
use crate::entry::LogEntry;
use crate::stream::{
    HoleFillDecision, HoleFillPolicy, LogStream, StreamEntry, StreamError, TimeoutHoleFillConfig,
    TimeoutHoleFillPolicy,
};
use crate::txn::{LogHandle, TxRecord, TxnRuntime};
use crate::types::{Address, Timestamp};
use log::{debug, trace};
use std::any::Any;
use std::sync::Arc;

/// The primary replica of one replicated object: a stream cursor, the live
/// in-memory object, and the replay pointer marking how far the object has
/// been brought up to date.
///
/// All replay happens in `sync`; nothing applies commands in the
/// background. Two engines opened on the same stream converge because
/// `apply` is deterministic and the log order is fixed.
pub struct SmrEngine<S: StateMachine> {
    stream: Arc<LogStream>,
    object: S,
    pointer: Timestamp,
    txn: Arc<TxnRuntime>,
    log: LogHandle,
    holes: TimeoutHoleFillPolicy,
}

impl<S: StateMachine> SmrEngine<S> {
    pub fn new(stream: Arc<LogStream>, txn: Arc<TxnRuntime>) -> Self {
        let log = LogHandle {
            sequencer: Arc::clone(stream.sequencer()),
            chain: Arc::clone(stream.chain()),
        };
        let holes = TimeoutHoleFillPolicy::new(txn.replica_hole_config());
        Self {
            stream,
            object: S::default(),
            pointer: Timestamp::BeforeAll,
            txn,
            log,
            holes,
        }
    }

    pub fn with_hole_config(mut self, config: TimeoutHoleFillConfig) -> Self {
        self.holes = TimeoutHoleFillPolicy::new(config);
        self
    }

    pub fn stream(&self) -> &Arc<LogStream> {
        &self.stream
    }

    /// Read access to the object at its current replay point. Callers that
    /// need point-in-time semantics go through `checkout_at`.
    pub fn object(&self) -> &S {
        &self.object
    }

    /// How far the object has been replayed.
    pub fn pointer(&self) -> Timestamp {
        self.pointer
    }

    /// Serializes `command`, appends it to the stream, and returns the log
    /// position it landed at. The local object is NOT updated; the command
    /// takes effect on the next `sync` that covers its position, like on
    /// every other replica.
    pub fn propose(&self, command: &S::Command) -> Result<Timestamp, SmrError> {
        let body = serde_json::to_vec(command)?;
        let frame = CommandFrame::object(body);
        let at = self.stream.append(frame.encode())?;
        debug!("event=smr_propose stream={} at={at}", self.stream.id());
        Ok(at)
    }

    /// Replays the stream forward until the object covers `target`.
    /// `Latest` resolves against the sequencer tail at call time. Holes are
    /// waited out and then filled per the engine's timeout policy.
    pub fn sync(&mut self, target: Timestamp) -> Result<(), SmrError> {
        let bound = match target {
            Timestamp::BeforeAll => return Ok(()),
            Timestamp::Position(address) => address,
            Timestamp::Latest => match self.stream.sequencer().current()? {
                Timestamp::Position(last) => last,
                _ => return Ok(()),
            },
        };
        loop {
            match self.stream.read_next_entry_upto(bound) {
                Ok(StreamEntry { address, entry }) => self.apply_entry(address, &entry)?,
                Err(StreamError::EndOfStream { .. }) => break,
                Err(StreamError::HoleEncountered { address }) => {
                    match self.holes.apply(address, &self.stream)? {
                        HoleFillDecision::Deferred(wait) => std::thread::sleep(wait),
                        HoleFillDecision::Filled => {}
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
        // Positions skipped over (holes, foreign entries) still advance the
        // pointer: the object provably reflects everything at or below the
        // cursor.
        let reached = self.stream.cursor_position();
        if reached > 0 {
            self.pointer = self.pointer.max(Timestamp::Position(reached - 1));
        }
        Ok(())
    }

    /// Syncs up to `required` and lends out the object fixed at that point.
    /// Rejected when the object has already replayed past it; replay never
    /// rewinds.
    pub fn checkout_at(
        &mut self,
        required: Timestamp,
    ) -> Result<PassThroughEngine<'_, S>, SmrError> {
        if self.pointer > required {
            return Err(SmrError::UnsupportedOperation {
                pointer: self.pointer,
                required,
            });
        }
        self.sync(required)?;
        Ok(PassThroughEngine::new(&mut self.object, required))
    }

    fn apply_entry(&mut self, address: Address, entry: &LogEntry) -> Result<(), SmrError> {
        let frame = CommandFrame::decode(&entry.payload)?;
        match frame.kind {
            FrameKind::Object => {
                // Broadcast object frames belong to no particular stream;
                // only frames tagged with ours mutate the object.
                if entry.metadata.contains_stream(&self.stream.id()) {
                    let command: S::Command = serde_json::from_slice(&frame.body)?;
                    self.object.apply(&command);
                    trace!(
                        "event=smr_apply stream={} address={address}",
                        self.stream.id()
                    );
                }
            }
            FrameKind::Transaction => {
                let record: TxRecord =
                    serde_json::from_slice(&frame.body).map_err(SmrError::Decode)?;
                self.txn.apply_during_replay(
                    &record,
                    address,
                    self.stream.id(),
                    &entry.metadata.streams,
                    &mut self.object as &mut dyn Any,
                    &self.log,
                )?;
            }
        }
        self.pointer = Timestamp::Position(address);
        Ok(())
    }
}

impl<S: StateMachine> EngineCore for SmrEngine<S> {
    fn sync(&mut self, target: Timestamp) -> Result<(), SmrError> {
        SmrEngine::sync(self, target)
    }

    fn pointer(&self) -> Timestamp {
        SmrEngine::pointer(self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
