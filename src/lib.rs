//! Plexlog: a distributed shared log with a global sequencer, write-once
//! replicated storage, multiplexed streams, and state-machine replication
//! with optimistic transactions layered on top.
//!
//! The log is the only communication channel: clients reserve addresses
//! from the sequencer, replicate entries across layered log-unit chains,
//! and build replicated objects by deterministically replaying streams.

pub mod entry;
pub mod inspect;
pub mod logunit;
pub mod replication;
pub mod runtime;
pub mod sequencer;
pub mod smr;
pub mod stream;
pub mod txn;
pub mod types;
pub mod util;
pub mod view;

pub use entry::{EntryMetadata, LogEntry};
pub use inspect::{InspectError, LogInspector, RangeReport, SlotReport};
pub use logunit::{
    CommitTarget, InMemoryLogUnit, InMemoryLogUnitOptions, LogUnit, LogUnitError, ReadOutcome,
    WriteOutcome,
};
pub use replication::{ChainReplication, ReadTarget, ReplicationError};
pub use runtime::{ObjectHandle, Runtime, RuntimeError, RuntimeOptions};
pub use sequencer::{InMemorySequencer, Sequencer, SequencerError, StreamReservation};
pub use smr::{
    BufferedEngine, CommandFrame, CommandFrameError, EngineCore, FrameKind, NullEngine,
    PassThroughEngine, SmrEngine, SmrError, StateMachine, FRAME_MAGIC,
};
pub use stream::{
    HoleFillDecision, HoleFillPolicy, LogStream, StreamEntry, StreamError, TimeoutHoleFillConfig,
    TimeoutHoleFillPolicy,
};
pub use txn::{
    CommandRegistry, LogHandle, OutcomeBoard, TxCommand, TxContext, TxError, TxMode, TxOutcome,
    TxRecord, TxVerdict, TxnRuntime,
};
pub use types::{Address, Rank, StreamId, Timestamp};
pub use util::{PlexlogError, RetryPolicy};
pub use view::{
    CachingViewProvider, InMemoryLayoutSource, LayoutDocument, LayoutError, LayoutSource,
    LayoutStore, LayoutView, MemoryNodeDirectory, ProtocolRegistry, ResolvedSegment,
    SegmentDocument, ViewProvider,
};
