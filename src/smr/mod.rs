//! State-machine replication: replays a stream's ordered commands against an
//! in-memory object so every replica converges to the same state.

mod command;
mod engine;
mod variants;

pub use command::{CommandFrame, CommandFrameError, FrameKind, FRAME_MAGIC};
pub use engine::SmrEngine;
pub use variants::{BufferedEngine, NullEngine, PassThroughEngine};

use crate::replication::ReplicationError;
use crate::sequencer::SequencerError;
use crate::stream::StreamError;
use crate::txn::TxError;
use crate::types::Timestamp;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use thiserror::Error;

/// A replicated object. `apply` must be deterministic: the same ordered
/// command sequence produces bit-identical state on every replica.
pub trait StateMachine: Default + Send + 'static {
    type Command: Serialize + DeserializeOwned + Clone + Send;

    fn apply(&mut self, command: &Self::Command);
}

/// Object-safe engine surface the runtime's object table is built from.
pub trait EngineCore: Send {
    fn sync(&mut self, target: Timestamp) -> Result<(), SmrError>;
    fn pointer(&self) -> Timestamp;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Error)]
pub enum SmrError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Frame(#[from] CommandFrameError),
    #[error("command decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("transaction replay failed: {0}")]
    Tx(#[source] Box<TxError>),
    /// Programming-contract violation: the object is already ahead of the
    /// position the caller requires, and replay cannot rewind.
    #[error("object replayed to {pointer} is ahead of required position {required}")]
    UnsupportedOperation {
        pointer: Timestamp,
        required: Timestamp,
    },
    #[error("engine holds a different object type than requested")]
    EngineTypeMismatch,
}

impl From<TxError> for SmrError {
    fn from(err: TxError) -> Self {
        SmrError::Tx(Box::new(err))
    }
}
