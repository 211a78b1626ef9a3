//! The client-facing runtime: one object per process holding the resolved
//! layout machinery, the sequencer handle, the replication chain, and the
//! table of open replicated objects.

use crate::entry::EntryMetadata;
use crate::replication::{ChainReplication, ReplicationError};
use crate::sequencer::{Sequencer, SequencerError};
use crate::smr::{CommandFrame, EngineCore, NullEngine, SmrEngine, SmrError, StateMachine};
use crate::stream::LogStream;
use crate::txn::{
    CommandRegistry, LogHandle, OutcomeBoard, TxError, TxMode, TxOutcome, TxRecord, TxnRuntime,
};
use crate::types::{Address, StreamId, Timestamp};
use crate::util::retry::RetryPolicy;
use crate::view::{
    CachingViewProvider, InMemoryLayoutSource, LayoutDocument, LayoutError, LayoutSource,
    MemoryNodeDirectory, ProtocolRegistry, ViewProvider,
};
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Smr(#[from] SmrError),
    #[error(transparent)]
    Tx(#[from] TxError),
}

/// Construction-time knobs. Defaults mirror the embedded in-memory
/// deployment; production wiring swaps in a real layout source and backend
/// registrations.
pub struct RuntimeOptions {
    pub registry: Arc<ProtocolRegistry>,
    pub source: Arc<dyn LayoutSource>,
    pub sequencer_locator: String,
    pub retry: RetryPolicy,
}

impl RuntimeOptions {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        source: Arc<dyn LayoutSource>,
        sequencer_locator: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            source,
            sequencer_locator: sequencer_locator.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

type SharedEngine = Arc<Mutex<Box<dyn EngineCore>>>;

/// Entry point for everything a client does against the shared log.
pub struct Runtime {
    registry: Arc<ProtocolRegistry>,
    provider: Arc<dyn ViewProvider>,
    sequencer: Arc<dyn Sequencer>,
    chain: Arc<ChainReplication>,
    commands: Arc<CommandRegistry>,
    board: Arc<OutcomeBoard>,
    txn: Arc<TxnRuntime>,
    objects: Mutex<HashMap<StreamId, SharedEngine>>,
}

impl Runtime {
    pub fn open(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let provider: Arc<dyn ViewProvider> = Arc::new(CachingViewProvider::new(
            Arc::clone(&options.source),
            Arc::clone(&options.registry),
        ));
        let sequencer = options.registry.sequencer(&options.sequencer_locator)?;
        let chain = Arc::new(ChainReplication::with_retry(
            Arc::clone(&provider),
            options.retry,
        ));
        let commands = Arc::new(CommandRegistry::new());
        let board = Arc::new(OutcomeBoard::new());
        let txn = Arc::new(TxnRuntime::new(Arc::clone(&commands), Arc::clone(&board)));
        info!(
            "event=runtime_open sequencer={} epoch={}",
            options.sequencer_locator,
            provider.current()?.epoch
        );
        Ok(Self {
            registry: options.registry,
            provider,
            sequencer,
            chain,
            commands,
            board,
            txn,
            objects: Mutex::new(HashMap::new()),
        })
    }

    /// Single-process deployment over in-memory nodes: one segment with the
    /// given layers, a `memory:sequencer` counter, epoch 1.
    pub fn in_memory(layers: Vec<Vec<String>>) -> Result<(Self, MemoryNodeDirectory), RuntimeError> {
        let registry = Arc::new(ProtocolRegistry::new());
        let directory = MemoryNodeDirectory::new();
        registry.register_memory(directory.clone());
        let source = Arc::new(InMemoryLayoutSource::new(LayoutDocument::single_segment(
            1, layers,
        )));
        let runtime = Self::open(RuntimeOptions::new(registry, source, "memory:sequencer"))?;
        Ok((runtime, directory))
    }

    pub fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }

    pub fn chain(&self) -> &Arc<ChainReplication> {
        &self.chain
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn ViewProvider> {
        &self.provider
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn outcomes(&self) -> &Arc<OutcomeBoard> {
        &self.board
    }

    fn log_handle(&self) -> LogHandle {
        LogHandle {
            sequencer: Arc::clone(&self.sequencer),
            chain: Arc::clone(&self.chain),
        }
    }

    /// Opens an independent cursor over `stream`.
    pub fn open_stream(&self, stream: StreamId) -> LogStream {
        LogStream::open(
            stream,
            Arc::clone(&self.sequencer),
            Arc::clone(&self.chain),
        )
    }

    /// Opens (or re-attaches to) the replicated object behind `stream`.
    /// Each stream holds at most one engine per runtime; handles share it.
    pub fn open_object<S: StateMachine>(
        &self,
        stream: StreamId,
    ) -> Result<ObjectHandle<S>, RuntimeError> {
        let mut objects = self.objects.lock();
        let engine = objects.entry(stream).or_insert_with(|| {
            debug!("event=object_open stream={stream}");
            let cursor = LogStream::open(
                stream,
                Arc::clone(&self.sequencer),
                Arc::clone(&self.chain),
            );
            let engine: Box<dyn EngineCore> =
                Box::new(SmrEngine::<S>::new(Arc::new(cursor), Arc::clone(&self.txn)));
            Arc::new(Mutex::new(engine))
        });
        let handle = ObjectHandle {
            stream,
            engine: Arc::clone(engine),
            _marker: PhantomData,
        };
        // Re-attachment with a different type surfaces here, not on use.
        handle.with(|_| ())?;
        Ok(handle)
    }

    /// Runs a transaction whose participant streams are known up front.
    /// The record lands tagged with every participant; replicas of other
    /// streams never see it.
    pub fn run_simple(
        &self,
        participants: &[StreamId],
        command: &str,
        args: Value,
    ) -> Result<Option<Value>, RuntimeError> {
        let engines: Vec<(StreamId, SharedEngine)> = {
            let objects = self.objects.lock();
            participants
                .iter()
                .map(|stream| {
                    objects
                        .get(stream)
                        .map(|engine| (*stream, Arc::clone(engine)))
                        .ok_or(TxError::ObjectNotOpen(*stream))
                })
                .collect::<Result<_, _>>()?
        };
        let mut precondition = Timestamp::BeforeAll;
        for (_, engine) in &engines {
            let mut engine = engine.lock();
            engine.sync(Timestamp::Latest)?;
            precondition = precondition.max(engine.pointer());
        }
        let record = TxRecord {
            command: command.to_string(),
            args,
            precondition,
            mode: TxMode::Simple,
        };
        let metadata = EntryMetadata::for_streams(participants.iter().copied());
        let at = self.propose_record(&record, metadata)?;
        for (_, engine) in &engines {
            engine.lock().sync(Timestamp::Position(at))?;
        }
        self.resolve_outcome(at).map_err(RuntimeError::from)
    }

    /// Runs a transaction whose participants are discovered at execution
    /// time. The record is broadcast, every replica re-executes it, and the
    /// proposer observes the outcome through a stateless replica.
    pub fn run_deferred(&self, command: &str, args: Value) -> Result<Option<Value>, RuntimeError> {
        let at = self.sequencer.reserve(1)?;
        let record = TxRecord {
            command: command.to_string(),
            args,
            precondition: Timestamp::before(at),
            mode: TxMode::Deferred,
        };
        let frame = CommandFrame::transaction(serde_json::to_vec(&record).map_err(TxError::Args)?);
        self.chain.write(at, EntryMetadata::unscoped(), frame.encode())?;
        debug!("event=tx_deferred command={command} at={at}");
        let mut observer = NullEngine::new(self.log_handle(), Arc::clone(&self.txn));
        observer.sync(Timestamp::Position(at))?;
        let engines: Vec<SharedEngine> = self.objects.lock().values().cloned().collect();
        for engine in engines {
            engine.lock().sync(Timestamp::Position(at))?;
        }
        self.resolve_outcome(at).map_err(RuntimeError::from)
    }

    fn propose_record(
        &self,
        record: &TxRecord,
        metadata: EntryMetadata,
    ) -> Result<Address, RuntimeError> {
        let at = self.sequencer.reserve(1)?;
        let frame = CommandFrame::transaction(serde_json::to_vec(record).map_err(TxError::Args)?);
        self.chain.write(at, metadata, frame.encode())?;
        debug!(
            "event=tx_propose command={} at={at} precondition={}",
            record.command, record.precondition
        );
        Ok(at)
    }

    fn resolve_outcome(&self, at: Address) -> Result<Option<Value>, TxError> {
        let outcome: TxOutcome = self.board.get(at).ok_or(TxError::OutcomeMissing(at))?;
        if outcome.is_aborted() {
            return Err(TxError::Aborted { at });
        }
        Ok(outcome.value)
    }
}

/// Typed handle onto a shared engine. Cheap to clone; all handles for a
/// stream drive the same object.
pub struct ObjectHandle<S: StateMachine> {
    stream: StreamId,
    engine: SharedEngine,
    _marker: PhantomData<fn() -> S>,
}

impl<S: StateMachine> Clone for ObjectHandle<S> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream,
            engine: Arc::clone(&self.engine),
            _marker: PhantomData,
        }
    }
}

impl<S: StateMachine> ObjectHandle<S> {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Brings the object up to `target` (see `SmrEngine::sync`).
    pub fn sync(&self, target: Timestamp) -> Result<(), SmrError> {
        self.engine.lock().sync(target)
    }

    pub fn pointer(&self) -> Timestamp {
        self.engine.lock().pointer()
    }

    /// Runs `f` against the object as currently replayed, without syncing.
    pub fn with<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, SmrError> {
        let mut engine = self.engine.lock();
        let engine = engine
            .as_any_mut()
            .downcast_mut::<SmrEngine<S>>()
            .ok_or(SmrError::EngineTypeMismatch)?;
        Ok(f(engine.object()))
    }

    /// Syncs to the latest issued position, then runs `f`.
    pub fn query<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, SmrError> {
        let mut engine = self.engine.lock();
        engine.sync(Timestamp::Latest)?;
        let engine = engine
            .as_any_mut()
            .downcast_mut::<SmrEngine<S>>()
            .ok_or(SmrError::EngineTypeMismatch)?;
        Ok(f(engine.object()))
    }

    /// Appends a command to the object's stream. Takes effect on sync.
    pub fn propose(&self, command: &S::Command) -> Result<Timestamp, SmrError> {
        let mut engine = self.engine.lock();
        let engine = engine
            .as_any_mut()
            .downcast_mut::<SmrEngine<S>>()
            .ok_or(SmrError::EngineTypeMismatch)?;
        engine.propose(command)
    }
}
