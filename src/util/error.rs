use crate::logunit::LogUnitError;
use crate::replication::ReplicationError;
use crate::runtime::RuntimeError;
use crate::sequencer::SequencerError;
use crate::smr::{CommandFrameError, SmrError};
use crate::stream::StreamError;
use crate::txn::TxError;
use crate::view::LayoutError;
use thiserror::Error;

/// Umbrella error for callers that funnel every failure into one type.
/// Module-level errors stay the primary interface; this exists for binaries
/// and tests that mix layers.
#[derive(Debug, Error)]
pub enum PlexlogError {
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    LogUnit(#[from] LogUnitError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Frame(#[from] CommandFrameError),
    #[error(transparent)]
    Smr(#[from] SmrError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Other(String),
}
