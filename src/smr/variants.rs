//! Engine variants beyond the primary replica: a borrowed point-in-time
//! view, a throwaway private replica, and a stateless observer.

use super::{CommandFrame, FrameKind, SmrError, StateMachine};
use crate::logunit::ReadOutcome;
use crate::replication::ReadTarget;
use crate::stream::{
    HoleFillDecision, HoleFillPolicy, LogStream, StreamEntry, StreamError, TimeoutHoleFillPolicy,
};
use crate::txn::{LogHandle, TxError, TxRecord, TxnRuntime};
use crate::types::{Address, StreamId, Timestamp};
use log::{debug, trace};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A borrowed object fixed at one timestamp. Does not replay; mutations go
/// straight through to the underlying object. This is the shape a
/// transaction sees its executing object in, and what `checkout_at` lends
/// out.
pub struct PassThroughEngine<'a, S: StateMachine> {
    object: &'a mut S,
    at: Timestamp,
}

impl<'a, S: StateMachine> PassThroughEngine<'a, S> {
    pub fn new(object: &'a mut S, at: Timestamp) -> Self {
        Self { object, at }
    }

    pub fn object(&self) -> &S {
        self.object
    }

    pub fn object_mut(&mut self) -> &mut S {
        self.object
    }

    pub fn pointer(&self) -> Timestamp {
        self.at
    }
}

/// A private replica built from scratch by replaying a stream up to a fixed
/// timestamp. Transactions use it to reach objects other than the one they
/// execute on; mutations stay in the copy and are dropped with it.
pub struct BufferedEngine<S: StateMachine> {
    object: S,
    pointer: Timestamp,
}

impl<S: StateMachine> BufferedEngine<S> {
    /// Replays `stream` from the beginning up to `at`. Nested transaction
    /// frames re-execute privately; `depth` caps the recursion.
    pub fn load(
        stream: StreamId,
        at: Timestamp,
        log: &LogHandle,
        runtime: &Arc<TxnRuntime>,
        depth: usize,
    ) -> Result<Self, TxError> {
        let mut replica = Self {
            object: S::default(),
            pointer: Timestamp::BeforeAll,
        };
        let bound = match at {
            Timestamp::BeforeAll => return Ok(replica),
            Timestamp::Position(address) => address,
            Timestamp::Latest => match log.sequencer.current()? {
                Timestamp::Position(last) => last,
                _ => return Ok(replica),
            },
        };
        let cursor = LogStream::open(stream, Arc::clone(&log.sequencer), Arc::clone(&log.chain));
        let mut holes = TimeoutHoleFillPolicy::new(runtime.replica_hole_config());
        loop {
            match cursor.read_next_entry_upto(bound) {
                Ok(StreamEntry { address, entry }) => {
                    let frame = CommandFrame::decode(&entry.payload)?;
                    match frame.kind {
                        FrameKind::Object => {
                            if entry.metadata.contains_stream(&stream) {
                                let command: S::Command =
                                    serde_json::from_slice(&frame.body).map_err(TxError::Decode)?;
                                replica.object.apply(&command);
                            }
                        }
                        FrameKind::Transaction => {
                            let record: TxRecord =
                                serde_json::from_slice(&frame.body).map_err(TxError::Decode)?;
                            runtime.apply_private(
                                &record,
                                address,
                                stream,
                                &entry.metadata.streams,
                                &mut replica.object as &mut dyn Any,
                                log,
                                depth,
                            )?;
                        }
                    }
                    replica.pointer = Timestamp::Position(address);
                }
                Err(StreamError::EndOfStream { .. }) => break,
                Err(StreamError::HoleEncountered { address }) => {
                    match holes.apply(address, &cursor)? {
                        HoleFillDecision::Deferred(wait) => std::thread::sleep(wait),
                        HoleFillDecision::Filled => {}
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
        trace!("event=replica_load stream={stream} at={at} pointer={}", replica.pointer);
        Ok(replica)
    }

    pub fn object(&self) -> &S {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut S {
        &mut self.object
    }

    pub fn pointer(&self) -> Timestamp {
        self.pointer
    }
}

/// A replica with no object: walks the physical log and hands every
/// transaction frame to the runtime for observe-only execution. The
/// proposer of a deferred transaction drives one of these to learn the
/// transaction's value without opening any object.
pub struct NullEngine {
    log: LogHandle,
    txn: Arc<TxnRuntime>,
    cursor: Address,
}

impl NullEngine {
    pub fn new(log: LogHandle, txn: Arc<TxnRuntime>) -> Self {
        Self {
            log,
            txn,
            cursor: 0,
        }
    }

    pub fn position(&self) -> Address {
        self.cursor
    }

    /// Walks physical addresses up to `target`, observing transaction
    /// frames and skipping everything else. Holes are waited out for the
    /// replica grace period and then filled.
    pub fn sync(&mut self, target: Timestamp) -> Result<(), SmrError> {
        let bound = match target {
            Timestamp::BeforeAll => return Ok(()),
            Timestamp::Position(address) => address,
            Timestamp::Latest => match self.log.sequencer.current()? {
                Timestamp::Position(last) => last,
                _ => return Ok(()),
            },
        };
        let config = self.txn.replica_hole_config();
        let grace = Duration::from_millis(config.grace_ms);
        let retry = Duration::from_millis(config.retry_ms);
        while self.cursor <= bound {
            let address = self.cursor;
            match self.log.chain.read(ReadTarget::Physical(address))? {
                ReadOutcome::Unwritten => {
                    let since = Instant::now();
                    loop {
                        std::thread::sleep(retry);
                        match self.log.chain.read(ReadTarget::Physical(address))? {
                            ReadOutcome::Unwritten if since.elapsed() >= grace => {
                                self.log.chain.fill_hole(address)?;
                                debug!("event=null_engine_hole_fill address={address}");
                                break;
                            }
                            ReadOutcome::Unwritten => {}
                            _ => break,
                        }
                    }
                }
                ReadOutcome::Data(entry) => {
                    self.observe_entry(address, &entry.payload);
                    self.cursor = address + 1;
                }
                ReadOutcome::FilledHole | ReadOutcome::Trimmed => {
                    self.cursor = address + 1;
                }
            }
        }
        Ok(())
    }

    fn observe_entry(&self, address: Address, payload: &[u8]) {
        // Raw stream appends share the physical log with framed commands;
        // anything that is not a frame carries nothing to observe.
        let frame = match CommandFrame::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("event=null_engine_skip_unframed address={address} error={err}");
                return;
            }
        };
        if frame.kind == FrameKind::Transaction {
            let record: TxRecord = match serde_json::from_slice(&frame.body) {
                Ok(record) => record,
                Err(err) => {
                    debug!("event=null_engine_skip_unframed address={address} error={err}");
                    return;
                }
            };
            // A transaction that cannot be observed (unknown command, bad
            // arguments) just contributes no value; its verdicts come from
            // the replicas.
            if let Err(err) = self.txn.observe(&record, address, &self.log) {
                debug!("event=null_engine_observe_skip address={address} error={err}");
            }
        }
    }
}
