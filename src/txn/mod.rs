//! Optimistic multi-stream transactions over the shared log.
//!
//! A transaction is proposed once, as a command record written at a
//! reserved address, and re-executed independently by every interested
//! replica at replay time. Whether the effects are inert (conflict,
//! `Aborted`) is decided by a deterministic scan of the log between the
//! record's precondition and its own address, so every replica reaches the
//! same verdict. Proposed entries are never rolled back.

use crate::logunit::ReadOutcome;
use crate::replication::{ChainReplication, ReadTarget, ReplicationError};
use crate::sequencer::{Sequencer, SequencerError};
use crate::smr::{BufferedEngine, CommandFrameError, PassThroughEngine, StateMachine};
use crate::stream::{StreamError, TimeoutHoleFillConfig};
use crate::types::{Address, StreamId, Timestamp};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Replica replay may nest (a transaction reads an object whose history
/// contains transactions). The depth cap turns a pathological chain into an
/// error instead of a stack overflow.
const MAX_REPLAY_DEPTH: usize = 16;

/// How the participant set was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    /// Stream set known before execution and tagged on the entry.
    Simple,
    /// Stream set discovered at replay time; the entry is a broadcast and
    /// every engine re-executes it.
    Deferred,
}

/// The serialized form of a transaction as it travels through the log:
/// a registered command name, its arguments, and the read-set precondition
/// captured at execute time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub command: String,
    pub args: Value,
    pub precondition: Timestamp,
    pub mode: TxMode,
}

#[derive(Debug, Error)]
pub enum TxError {
    /// Precondition violated on at least one participant's view.
    #[error("transaction at address {at} aborted")]
    Aborted { at: Address },
    #[error("no command registered under {0:?}")]
    UnknownCommand(String),
    #[error("command arguments rejected: {0}")]
    Args(#[source] serde_json::Error),
    #[error("stream {0} holds a different object type than the command expects")]
    ObjectTypeMismatch(StreamId),
    #[error("no object is open for stream {0}")]
    ObjectNotOpen(StreamId),
    #[error("transaction replay exceeded depth {MAX_REPLAY_DEPTH}")]
    DepthExceeded,
    #[error("transaction outcome missing for address {0}")]
    OutcomeMissing(Address),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Frame(#[from] CommandFrameError),
    #[error("record decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A re-executable transaction command. Implementations touch objects only
/// through the context, so replicas can both re-run the effects and discover
/// stream membership as a side effect (the deferred pattern).
pub trait TxCommand: Send + Sync {
    fn execute(&self, ctx: &mut TxContext<'_>) -> Result<Value, TxError>;
}

type CommandCtor = Arc<dyn Fn(&Value) -> Result<Box<dyn TxCommand>, TxError> + Send + Sync>;

/// Explicit name-to-constructor registry for transaction commands, passed at
/// runtime construction. Closures cannot cross the log, so every replica
/// reconstructs commands from (name, args) through its own registry.
#[derive(Default)]
pub struct CommandRegistry {
    ctors: RwLock<HashMap<String, CommandCtor>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, ctor: F)
    where
        F: Fn(&Value) -> Result<Box<dyn TxCommand>, TxError> + Send + Sync + 'static,
    {
        self.ctors.write().insert(name.to_string(), Arc::new(ctor));
    }

    /// Registers a command type whose arguments deserialize straight into it.
    pub fn register_typed<C>(&self, name: &str)
    where
        C: TxCommand + DeserializeOwned + 'static,
    {
        self.register(name, |args| {
            let command: C = serde_json::from_value(args.clone()).map_err(TxError::Args)?;
            Ok(Box::new(command))
        });
    }

    pub fn build(&self, name: &str, args: &Value) -> Result<Box<dyn TxCommand>, TxError> {
        let ctor = self
            .ctors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TxError::UnknownCommand(name.to_string()))?;
        ctor(args)
    }
}

/// Per-replica verdict for one proposed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxVerdict {
    Committed,
    Aborted,
}

/// Resolved outcome of a proposed transaction, accumulated as replicas
/// replay it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOutcome {
    pub value: Option<Value>,
    pub committed: BTreeSet<StreamId>,
    pub aborted: BTreeSet<StreamId>,
}

impl TxOutcome {
    pub fn is_aborted(&self) -> bool {
        !self.aborted.is_empty()
    }
}

/// Runtime-scoped table of transaction outcomes keyed by log address, read
/// by the proposer after syncing past its proposal.
#[derive(Default)]
pub struct OutcomeBoard {
    outcomes: Mutex<HashMap<Address, TxOutcome>>,
}

impl OutcomeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_verdict(&self, at: Address, stream: StreamId, verdict: TxVerdict) {
        let mut outcomes = self.outcomes.lock();
        let outcome = outcomes.entry(at).or_default();
        match verdict {
            TxVerdict::Committed => outcome.committed.insert(stream),
            TxVerdict::Aborted => outcome.aborted.insert(stream),
        };
    }

    /// First value wins; replicas compute identical values, so later
    /// recordings are redundant by determinism.
    pub fn record_value(&self, at: Address, value: Value) {
        let mut outcomes = self.outcomes.lock();
        let outcome = outcomes.entry(at).or_default();
        if outcome.value.is_none() {
            outcome.value = Some(value);
        }
    }

    pub fn get(&self, at: Address) -> Option<TxOutcome> {
        self.outcomes.lock().get(&at).cloned()
    }
}

/// Everything a replica needs to reach the log during re-execution.
#[derive(Clone)]
pub struct LogHandle {
    pub sequencer: Arc<dyn Sequencer>,
    pub chain: Arc<ChainReplication>,
}

/// Shared transaction machinery: the command registry, the outcome board,
/// and the replica hole-fill configuration.
pub struct TxnRuntime {
    commands: Arc<CommandRegistry>,
    board: Arc<OutcomeBoard>,
    replica_holes: TimeoutHoleFillConfig,
}

impl TxnRuntime {
    pub fn new(commands: Arc<CommandRegistry>, board: Arc<OutcomeBoard>) -> Self {
        Self {
            commands,
            board,
            replica_holes: TimeoutHoleFillConfig::default(),
        }
    }

    pub fn with_replica_holes(mut self, config: TimeoutHoleFillConfig) -> Self {
        self.replica_holes = config;
        self
    }

    pub fn board(&self) -> &Arc<OutcomeBoard> {
        &self.board
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn replica_hole_config(&self) -> TimeoutHoleFillConfig {
        self.replica_holes
    }

    /// Scans the physical log between `precondition` (exclusive) and `at`
    /// (exclusive) for entries touching any participant stream. Broadcast
    /// entries count: they may touch anything.
    ///
    /// Every position in the range is forced to resolve (waiting out the
    /// replica grace period, then hole-filling) before the verdict is
    /// returned, so every replica computes the same answer from the same
    /// resolved prefix.
    fn conflicts(
        &self,
        record: &TxRecord,
        at: Address,
        participants: &BTreeSet<StreamId>,
        log: &LogHandle,
    ) -> Result<bool, TxError> {
        let start = match record.precondition {
            Timestamp::BeforeAll => 0,
            Timestamp::Position(position) => position + 1,
            Timestamp::Latest => return Ok(false),
        };
        let grace = Duration::from_millis(self.replica_holes.grace_ms);
        let retry = Duration::from_millis(self.replica_holes.retry_ms);
        for address in start..at {
            loop {
                match log.chain.read(ReadTarget::Physical(address))? {
                    ReadOutcome::Data(entry) => {
                        let touches = entry.metadata.is_broadcast()
                            || entry
                                .metadata
                                .streams
                                .iter()
                                .any(|stream| participants.contains(stream));
                        if touches {
                            return Ok(true);
                        }
                        break;
                    }
                    ReadOutcome::FilledHole | ReadOutcome::Trimmed => break,
                    ReadOutcome::Unwritten => {
                        let since = Instant::now();
                        loop {
                            std::thread::sleep(retry);
                            match log.chain.read(ReadTarget::Physical(address))? {
                                ReadOutcome::Unwritten if since.elapsed() >= grace => {
                                    log.chain.fill_hole(address)?;
                                    break;
                                }
                                ReadOutcome::Unwritten => {}
                                _ => break,
                            }
                        }
                    }
                }
            }
        }
        Ok(false)
    }

    /// Re-executes `record` against a replaying engine's own object. Called
    /// by an SMR engine when its cursor reaches a transaction frame;
    /// `participants` is the stream set the record's entry was tagged with.
    ///
    /// The conflict check is global, not per-engine: an intervening entry on
    /// any participant stream aborts the transaction on every replica alike.
    pub fn apply_during_replay(
        self: &Arc<Self>,
        record: &TxRecord,
        at: Address,
        stream: StreamId,
        participants: &BTreeSet<StreamId>,
        object: &mut dyn Any,
        log: &LogHandle,
    ) -> Result<TxVerdict, TxError> {
        if self.conflicts(record, at, participants, log)? {
            warn!(
                "event=tx_conflict at={at} stream={stream} precondition={}",
                record.precondition
            );
            self.board.record_verdict(at, stream, TxVerdict::Aborted);
            return Ok(TxVerdict::Aborted);
        }
        // A record that cannot even be reconstructed stays in the log
        // forever; treating it as an abort keeps the stream replayable.
        let command = match self.commands.build(&record.command, &record.args) {
            Ok(command) => command,
            Err(err) => {
                warn!("event=tx_command_rejected at={at} stream={stream} error={err}");
                self.board.record_verdict(at, stream, TxVerdict::Aborted);
                return Ok(TxVerdict::Aborted);
            }
        };
        let mut ctx = TxContext {
            executing: Some(stream),
            object: Some(object),
            at: record.precondition,
            log,
            runtime: self,
            touched: BTreeSet::new(),
            depth: 0,
        };
        match command.execute(&mut ctx) {
            Ok(value) => {
                debug!("event=tx_apply at={at} stream={stream} touched={}", ctx.touched.len());
                self.board.record_value(at, value);
                self.board.record_verdict(at, stream, TxVerdict::Committed);
                Ok(TxVerdict::Committed)
            }
            Err(err) => {
                warn!("event=tx_apply_failed at={at} stream={stream} error={err}");
                self.board.record_verdict(at, stream, TxVerdict::Aborted);
                Ok(TxVerdict::Aborted)
            }
        }
    }

    /// Observe-only execution used by the null engine: computes the
    /// transaction's value against private replicas without mutating any
    /// live object or recording a per-stream verdict.
    pub fn observe(
        self: &Arc<Self>,
        record: &TxRecord,
        at: Address,
        log: &LogHandle,
    ) -> Result<(), TxError> {
        let command = self.commands.build(&record.command, &record.args)?;
        let mut ctx = TxContext {
            executing: None,
            object: None,
            at: record.precondition,
            log,
            runtime: self,
            touched: BTreeSet::new(),
            depth: 0,
        };
        match command.execute(&mut ctx) {
            Ok(value) => {
                self.board.record_value(at, value);
                Ok(())
            }
            Err(err) => {
                warn!("event=tx_observe_failed at={at} error={err}");
                Err(err)
            }
        }
    }

    /// Private re-execution during buffered-replica replay. No board
    /// recording; the replica is a throwaway copy. Applies the same global
    /// conflict check so copies match the live objects.
    pub(crate) fn apply_private(
        self: &Arc<Self>,
        record: &TxRecord,
        at: Address,
        stream: StreamId,
        participants: &BTreeSet<StreamId>,
        object: &mut dyn Any,
        log: &LogHandle,
        depth: usize,
    ) -> Result<(), TxError> {
        if self.conflicts(record, at, participants, log)? {
            return Ok(());
        }
        let command = match self.commands.build(&record.command, &record.args) {
            Ok(command) => command,
            Err(err) => {
                warn!("event=tx_replica_command_rejected stream={stream} error={err}");
                return Ok(());
            }
        };
        let mut ctx = TxContext {
            executing: Some(stream),
            object: Some(object),
            at: record.precondition,
            log,
            runtime: self,
            touched: BTreeSet::new(),
            depth,
        };
        // Failures on a private replica mirror an abort: the effects are
        // simply absent from the copy.
        if let Err(err) = command.execute(&mut ctx) {
            warn!("event=tx_replica_skip stream={stream} error={err}");
        }
        Ok(())
    }
}

/// Execution context handed to a transaction command.
///
/// The executing engine's own object is reached pass-through (mutations
/// land); any other stream resolves to a private replica replayed up to the
/// transaction's precondition, so reads are consistent and foreign mutations
/// are confined. Touched streams are recorded either way; that is how a
/// deferred transaction's membership is discovered.
pub struct TxContext<'a> {
    executing: Option<StreamId>,
    object: Option<&'a mut dyn Any>,
    at: Timestamp,
    log: &'a LogHandle,
    runtime: &'a Arc<TxnRuntime>,
    touched: BTreeSet<StreamId>,
    depth: usize,
}

impl<'a> TxContext<'a> {
    /// Runs `f` with mutable access to the object behind `stream`.
    pub fn update<S: StateMachine, R>(
        &mut self,
        stream: StreamId,
        f: impl FnOnce(&mut S) -> R,
    ) -> Result<R, TxError> {
        self.touched.insert(stream);
        if self.executing == Some(stream) {
            let object = self
                .object
                .as_mut()
                .map(|object| &mut **object)
                .ok_or(TxError::ObjectNotOpen(stream))?;
            let object = object
                .downcast_mut::<S>()
                .ok_or(TxError::ObjectTypeMismatch(stream))?;
            let mut engine = PassThroughEngine::new(object, self.at);
            Ok(f(engine.object_mut()))
        } else {
            if self.depth >= MAX_REPLAY_DEPTH {
                return Err(TxError::DepthExceeded);
            }
            let mut replica: BufferedEngine<S> = BufferedEngine::load(
                stream,
                self.at,
                self.log,
                self.runtime,
                self.depth + 1,
            )?;
            Ok(f(replica.object_mut()))
        }
    }

    /// Runs `f` with read access to the object behind `stream`.
    pub fn read<S: StateMachine, R>(
        &mut self,
        stream: StreamId,
        f: impl FnOnce(&S) -> R,
    ) -> Result<R, TxError> {
        self.update(stream, |object: &mut S| f(object))
    }

    /// Streams the command has touched so far.
    pub fn touched(&self) -> &BTreeSet<StreamId> {
        &self.touched
    }

    pub fn precondition(&self) -> Timestamp {
        self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_merges_verdicts() {
        let board = OutcomeBoard::new();
        let a = StreamId::new();
        let b = StreamId::new();
        board.record_verdict(7, a, TxVerdict::Committed);
        board.record_verdict(7, b, TxVerdict::Aborted);
        board.record_value(7, Value::from(41));
        board.record_value(7, Value::from(99));
        let outcome = board.get(7).unwrap();
        assert!(outcome.is_aborted());
        assert!(outcome.committed.contains(&a));
        assert_eq!(outcome.value, Some(Value::from(41)));
    }

    #[test]
    fn registry_rejects_unknown_commands() {
        let registry = CommandRegistry::new();
        assert!(matches!(
            registry.build("nope", &Value::Null),
            Err(TxError::UnknownCommand(_))
        ));
    }
}
