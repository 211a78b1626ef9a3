use super::{LogStream, StreamError};
use crate::types::Address;
use log::info;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// What a policy decided about an encountered hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoleFillDecision {
    /// Wait this long and re-read; the writer may still arrive.
    Deferred(Duration),
    /// The position was actively resolved as a permanent no-op; re-read now.
    Filled,
}

/// Strategy invoked when a stream cursor encounters an unresolved address.
///
/// Policies must be safe to run concurrently from multiple readers: the
/// underlying fill is idempotent, so two readers racing to resolve the same
/// hole both succeed.
pub trait HoleFillPolicy: Send {
    fn apply(&mut self, address: Address, stream: &LogStream)
        -> Result<HoleFillDecision, StreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutHoleFillConfig {
    /// How long a hole may persist before it is actively filled.
    pub grace_ms: u64,
    /// Delay between re-reads while waiting out the grace period.
    pub retry_ms: u64,
}

impl Default for TimeoutHoleFillConfig {
    fn default() -> Self {
        Self {
            grace_ms: 500,
            retry_ms: 50,
        }
    }
}

/// Timeout policy: waits a bounded grace period for the writer to show up,
/// then fills the hole so every reader unblocks permanently.
pub struct TimeoutHoleFillPolicy {
    config: TimeoutHoleFillConfig,
    watched: Option<(Address, Instant)>,
}

impl TimeoutHoleFillPolicy {
    pub fn new(config: TimeoutHoleFillConfig) -> Self {
        Self {
            config,
            watched: None,
        }
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self::new(TimeoutHoleFillConfig {
            grace_ms: grace.as_millis() as u64,
            retry_ms: TimeoutHoleFillConfig::default().retry_ms,
        })
    }
}

impl HoleFillPolicy for TimeoutHoleFillPolicy {
    fn apply(
        &mut self,
        address: Address,
        stream: &LogStream,
    ) -> Result<HoleFillDecision, StreamError> {
        let now = Instant::now();
        let first_seen = match self.watched {
            Some((watched, since)) if watched == address => since,
            _ => {
                self.watched = Some((address, now));
                now
            }
        };
        if now.duration_since(first_seen) < Duration::from_millis(self.config.grace_ms) {
            return Ok(HoleFillDecision::Deferred(Duration::from_millis(
                self.config.retry_ms,
            )));
        }
        stream.fill_hole(address)?;
        info!(
            "event=hole_fill_timeout stream={} address={address} grace_ms={}",
            stream.id(),
            self.config.grace_ms
        );
        self.watched = None;
        Ok(HoleFillDecision::Filled)
    }
}
