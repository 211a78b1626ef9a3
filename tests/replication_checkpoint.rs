mod common;

use common::cluster;
use plexlog::{
    ChainReplication, EntryMetadata, LayoutDocument, LogUnit, LogUnitError, ReadOutcome,
    ReadTarget, ReplicationError, RetryPolicy, StreamId, WriteOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn replicated_write_is_readable_and_write_once() {
    let cluster = cluster(2, 2);
    let stream = StreamId::new();
    cluster
        .chain
        .write(0, EntryMetadata::for_stream(stream, 0), b"hello".to_vec())
        .unwrap();
    match cluster.chain.read(ReadTarget::Physical(0)).unwrap() {
        ReadOutcome::Data(entry) => {
            assert_eq!(entry.payload, b"hello".to_vec());
            assert!(entry.metadata.commit);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(matches!(
        cluster
            .chain
            .write(0, EntryMetadata::for_stream(stream, 0), b"hello".to_vec()),
        Err(ReplicationError::Overwrite(0))
    ));
}

#[test]
fn stream_reads_route_through_the_logical_index() {
    let cluster = cluster(3, 2);
    let stream = StreamId::new();
    for logical in 0..3u64 {
        cluster
            .chain
            .write(
                logical,
                EntryMetadata::for_stream(stream, logical),
                format!("entry-{logical}").into_bytes(),
            )
            .unwrap();
    }
    match cluster
        .chain
        .read(ReadTarget::Stream { stream, logical: 2 })
        .unwrap()
    {
        ReadOutcome::Data(entry) => assert_eq!(entry.payload, b"entry-2".to_vec()),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn multi_stream_entries_without_logical_slots_commit_cleanly() {
    let cluster = cluster(2, 2);
    let (first, second) = (StreamId::new(), StreamId::new());
    // Tagged with two streams but carrying no logical addresses, the shape
    // every transaction record is written in.
    cluster
        .chain
        .write(0, EntryMetadata::for_streams([first, second]), b"txn".to_vec())
        .unwrap();
    match cluster.chain.read(ReadTarget::Physical(0)).unwrap() {
        ReadOutcome::Data(entry) => {
            assert!(entry.metadata.commit);
            assert!(entry.metadata.contains_stream(&first));
            assert!(entry.metadata.contains_stream(&second));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn uncommitted_entries_read_as_unwritten() {
    let cluster = cluster(1, 1);
    // Bypass the chain: land a provisional entry on both nodes without
    // flipping the commit bit, as a crashed writer would.
    let first = cluster.directory.raw_log_unit("l0-0");
    let second = cluster.directory.raw_log_unit("l1-0");
    let meta = EntryMetadata::unscoped();
    assert_eq!(
        first.write(0, meta.clone(), b"partial".to_vec()).unwrap(),
        WriteOutcome::Accepted
    );
    assert_eq!(
        second.write(0, meta, b"partial".to_vec()).unwrap(),
        WriteOutcome::Accepted
    );
    assert_eq!(
        cluster.chain.read(ReadTarget::Physical(0)).unwrap(),
        ReadOutcome::Unwritten
    );
}

#[test]
fn hole_fill_resolves_both_routed_nodes() {
    let cluster = cluster(2, 2);
    cluster.chain.fill_hole(5).unwrap();
    cluster.chain.fill_hole(5).unwrap();
    assert_eq!(
        cluster.chain.read(ReadTarget::Physical(5)).unwrap(),
        ReadOutcome::FilledHole
    );
    // A later write against the filled address is decisively rejected.
    assert!(matches!(
        cluster
            .chain
            .write(5, EntryMetadata::unscoped(), b"late".to_vec()),
        Err(ReplicationError::Overwrite(5))
    ));
}

#[test]
fn trim_propagates_to_every_node_in_the_segment() {
    let cluster = cluster(2, 2);
    for address in 0..4 {
        cluster
            .chain
            .write(address, EntryMetadata::unscoped(), vec![address as u8])
            .unwrap();
    }
    cluster.chain.trim(1).unwrap();
    assert_eq!(
        cluster.chain.read(ReadTarget::Physical(1)).unwrap(),
        ReadOutcome::Trimmed
    );
    assert!(matches!(
        cluster.chain.read(ReadTarget::Physical(2)).unwrap(),
        ReadOutcome::Data(_)
    ));
}

/// Node that fails every call until `failures` attempts have been burned,
/// then delegates. Stands in for a node behind a stale view.
struct FlakyUnit {
    inner: Arc<dyn LogUnit>,
    remaining: AtomicUsize,
}

impl FlakyUnit {
    fn trip(&self) -> Result<(), LogUnitError> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LogUnitError::Unavailable("injected fault".into()));
        }
        Ok(())
    }
}

impl LogUnit for FlakyUnit {
    fn write(
        &self,
        address: u64,
        metadata: EntryMetadata,
        payload: Vec<u8>,
    ) -> Result<WriteOutcome, LogUnitError> {
        self.trip()?;
        self.inner.write(address, metadata, payload)
    }

    fn read(&self, address: u64) -> Result<ReadOutcome, LogUnitError> {
        self.trip()?;
        self.inner.read(address)
    }

    fn read_stream(&self, stream: StreamId, logical: u64) -> Result<ReadOutcome, LogUnitError> {
        self.trip()?;
        self.inner.read_stream(stream, logical)
    }

    fn fill_hole(&self, address: u64) -> Result<(), LogUnitError> {
        self.trip()?;
        self.inner.fill_hole(address)
    }

    fn trim(&self, address: u64) -> Result<(), LogUnitError> {
        self.trip()?;
        self.inner.trim(address)
    }

    fn set_commit(
        &self,
        target: plexlog::CommitTarget,
        committed: bool,
    ) -> Result<(), LogUnitError> {
        self.trip()?;
        self.inner.set_commit(target, committed)
    }

    fn query_head(&self) -> Result<u64, LogUnitError> {
        self.inner.query_head()
    }

    fn query_tail(&self) -> Result<u64, LogUnitError> {
        self.inner.query_tail()
    }

    fn reset(&self, epoch: u64) -> Result<(), LogUnitError> {
        self.inner.reset(epoch)
    }

    fn ping(&self) -> bool {
        self.inner.ping()
    }
}

#[test]
fn transient_node_failures_are_retried_through_view_refresh() {
    let cluster = cluster(1, 1);
    let backing = cluster.directory.raw_log_unit("flaky-backing");
    let flaky = Arc::new(FlakyUnit {
        inner: backing,
        remaining: AtomicUsize::new(2),
    });
    let registered = Arc::clone(&flaky);
    cluster
        .registry
        .register_log_unit("flaky", move |_| Ok(Arc::clone(&registered) as Arc<dyn LogUnit>));
    cluster.source.publish(LayoutDocument::single_segment(
        2,
        vec![vec!["flaky:only".into()], cluster.layer1.clone()],
    ));
    cluster.provider.invalidate();

    cluster
        .chain
        .write(0, EntryMetadata::unscoped(), b"persistent".to_vec())
        .unwrap();
    assert!(matches!(
        cluster.chain.read(ReadTarget::Physical(0)).unwrap(),
        ReadOutcome::Data(_)
    ));
}

#[test]
fn retries_exhaust_against_a_node_that_never_recovers() {
    let cluster = cluster(1, 1);
    let backing = cluster.directory.raw_log_unit("dead-backing");
    let dead = Arc::new(FlakyUnit {
        inner: backing,
        remaining: AtomicUsize::new(usize::MAX),
    });
    let registered = Arc::clone(&dead);
    cluster
        .registry
        .register_log_unit("dead", move |_| Ok(Arc::clone(&registered) as Arc<dyn LogUnit>));
    cluster.source.publish(LayoutDocument::single_segment(
        2,
        vec![vec!["dead:only".into()], cluster.layer1.clone()],
    ));
    cluster.provider.invalidate();

    let chain = ChainReplication::with_retry(
        Arc::clone(&cluster.provider),
        RetryPolicy::new(3, Duration::from_millis(1)),
    );
    match chain.write(0, EntryMetadata::unscoped(), b"x".to_vec()) {
        Err(ReplicationError::RetriesExhausted { address, attempts, .. }) => {
            assert_eq!(address, 0);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected result {other:?}"),
    }
}
