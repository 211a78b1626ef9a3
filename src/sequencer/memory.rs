use super::{Sequencer, SequencerError, StreamReservation};
use crate::types::{Address, StreamId, Timestamp};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local sequencer backed by an atomic counter.
///
/// `next` holds the first unissued address, so a fetch-add of `count` hands
/// out a disjoint block without any lock. Stream-tagged reservations also
/// advance the stream's logical tail; those go through the tails mutex so
/// logical order always matches physical order within a stream.
#[derive(Debug, Default)]
pub struct InMemorySequencer {
    next: AtomicU64,
    stream_tails: Mutex<HashMap<StreamId, Address>>,
}

impl InMemorySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: Address) -> Self {
        Self {
            next: AtomicU64::new(first),
            stream_tails: Mutex::new(HashMap::new()),
        }
    }
}

impl Sequencer for InMemorySequencer {
    fn reserve(&self, count: u64) -> Result<Address, SequencerError> {
        if count == 0 {
            return Err(SequencerError::EmptyReservation);
        }
        let first = self.next.fetch_add(count, Ordering::SeqCst);
        if first.checked_add(count).is_none() {
            return Err(SequencerError::Exhausted);
        }
        debug!("event=sequencer_reserve first={first} count={count}");
        Ok(first)
    }

    fn reserve_stream(
        &self,
        stream: StreamId,
        count: u64,
    ) -> Result<StreamReservation, SequencerError> {
        if count == 0 {
            return Err(SequencerError::EmptyReservation);
        }
        // The physical fetch-add happens under the tails lock so two
        // reservations for one stream cannot cross: the lower logical block
        // always lands at the lower physical block.
        let mut tails = self.stream_tails.lock();
        let address = self.next.fetch_add(count, Ordering::SeqCst);
        if address.checked_add(count).is_none() {
            return Err(SequencerError::Exhausted);
        }
        let tail = tails.entry(stream).or_insert(0);
        let logical = *tail;
        *tail += count;
        debug!(
            "event=sequencer_reserve_stream stream={stream} address={address} logical={logical} count={count}"
        );
        Ok(StreamReservation { address, logical })
    }

    fn current(&self) -> Result<Timestamp, SequencerError> {
        match self.next.load(Ordering::SeqCst) {
            0 => Ok(Timestamp::BeforeAll),
            next => Ok(Timestamp::Position(next - 1)),
        }
    }

    fn recover(&self, last_known: Address) -> Result<(), SequencerError> {
        let floor = last_known.saturating_add(1);
        let previous = self.next.fetch_max(floor, Ordering::SeqCst);
        info!("event=sequencer_recover last_known={last_known} previous_next={previous}");
        Ok(())
    }

    fn ping(&self) -> bool {
        true
    }

    fn reset(&self) -> Result<(), SequencerError> {
        let mut tails = self.stream_tails.lock();
        self.next.store(0, Ordering::SeqCst);
        tails.clear();
        info!("event=sequencer_reset");
        Ok(())
    }
}
