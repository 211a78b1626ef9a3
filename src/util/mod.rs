//! Miscellaneous shared helpers (retry policies, umbrella error).

pub mod error;
pub mod retry;

pub use error::PlexlogError;
pub use retry::{RetryHandle, RetryPolicy};
