use plexlog::{
    CommitTarget, EntryMetadata, InMemoryLogUnit, InMemoryLogUnitOptions, LogUnit, Rank,
    ReadOutcome, StreamId, WriteOutcome,
};

fn tagged(stream: StreamId, logical: u64) -> EntryMetadata {
    EntryMetadata::for_stream(stream, logical)
}

#[test]
fn second_write_is_rejected_even_with_identical_payload() {
    let unit = InMemoryLogUnit::new();
    let meta = EntryMetadata::unscoped();
    assert_eq!(
        unit.write(3, meta.clone(), b"same".to_vec()).unwrap(),
        WriteOutcome::Accepted
    );
    assert_eq!(
        unit.write(3, meta, b"same".to_vec()).unwrap(),
        WriteOutcome::Overwrite
    );
}

#[test]
fn kilobyte_payload_survives_the_round_trip() {
    let unit = InMemoryLogUnit::new();
    let stream = StreamId::new();
    let payload: Vec<u8> = (0..1024u32).map(|n| (n % 251) as u8).collect();
    unit.write(9, tagged(stream, 0), payload.clone()).unwrap();
    match unit.read(9).unwrap() {
        ReadOutcome::Data(entry) => {
            assert_eq!(entry.payload.len(), 1024);
            assert_eq!(entry.payload, payload);
            assert!(entry.metadata.contains_stream(&stream));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn higher_rank_supersedes_only_uncommitted_entries() {
    let unit = InMemoryLogUnit::new();
    let base = EntryMetadata::unscoped();
    unit.write(0, base.clone(), b"provisional".to_vec()).unwrap();
    assert_eq!(
        unit.write(0, base.clone().with_rank(Rank(2)), b"winner".to_vec())
            .unwrap(),
        WriteOutcome::Accepted
    );
    match unit.read(0).unwrap() {
        ReadOutcome::Data(entry) => assert_eq!(entry.payload, b"winner".to_vec()),
        other => panic!("unexpected outcome {other:?}"),
    }

    unit.set_commit(CommitTarget::Address(0), true).unwrap();
    assert_eq!(
        unit.write(0, base.with_rank(Rank(9)), b"late".to_vec())
            .unwrap(),
        WriteOutcome::Overwrite
    );
}

#[test]
fn hole_fill_is_idempotent_and_never_clobbers_data() {
    let unit = InMemoryLogUnit::new();
    unit.fill_hole(5).unwrap();
    unit.fill_hole(5).unwrap();
    assert_eq!(unit.read(5).unwrap(), ReadOutcome::FilledHole);

    unit.write(6, EntryMetadata::unscoped(), b"data".to_vec())
        .unwrap();
    unit.fill_hole(6).unwrap();
    assert!(matches!(unit.read(6).unwrap(), ReadOutcome::Data(_)));
}

#[test]
fn trim_reclaims_everything_at_or_below_the_mark() {
    let unit = InMemoryLogUnit::new();
    for address in 0..4 {
        unit.write(address, EntryMetadata::unscoped(), vec![address as u8])
            .unwrap();
    }
    unit.trim(1).unwrap();
    assert_eq!(unit.read(0).unwrap(), ReadOutcome::Trimmed);
    assert_eq!(unit.read(1).unwrap(), ReadOutcome::Trimmed);
    assert!(matches!(unit.read(2).unwrap(), ReadOutcome::Data(_)));
    assert_eq!(
        unit.write(1, EntryMetadata::unscoped(), b"x".to_vec())
            .unwrap(),
        WriteOutcome::Trimmed
    );
    assert_eq!(unit.query_head().unwrap(), 2);
}

#[test]
fn capacity_and_sub_log_bounds_are_enforced() {
    let unit = InMemoryLogUnit::with_options(InMemoryLogUnitOptions {
        capacity: Some(2),
        served_range: Some(0..10),
    });
    assert_eq!(
        unit.write(20, EntryMetadata::unscoped(), b"a".to_vec())
            .unwrap(),
        WriteOutcome::SubLog
    );
    unit.write(0, EntryMetadata::unscoped(), b"a".to_vec())
        .unwrap();
    unit.write(1, EntryMetadata::unscoped(), b"b".to_vec())
        .unwrap();
    assert_eq!(
        unit.write(2, EntryMetadata::unscoped(), b"c".to_vec())
            .unwrap(),
        WriteOutcome::OutOfSpace
    );
}

#[test]
fn stream_index_serves_logical_reads_after_commit() {
    let unit = InMemoryLogUnit::new();
    let stream = StreamId::new();
    unit.write(4, tagged(stream, 0), b"first".to_vec()).unwrap();
    unit.set_commit(CommitTarget::Address(4), true).unwrap();
    unit.set_commit(CommitTarget::Stream(stream, 0), true)
        .unwrap();
    match unit.read_stream(stream, 0).unwrap() {
        ReadOutcome::Data(entry) => {
            assert_eq!(entry.payload, b"first".to_vec());
            assert!(entry.metadata.commit);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(unit.read_stream(stream, 1).unwrap(), ReadOutcome::Unwritten);
}

#[test]
fn reset_wipes_state_and_stamps_epoch() {
    let unit = InMemoryLogUnit::new();
    unit.write(0, EntryMetadata::unscoped(), b"gone".to_vec())
        .unwrap();
    unit.trim(0).unwrap();
    unit.reset(7).unwrap();
    assert_eq!(unit.epoch(), 7);
    assert_eq!(unit.read(0).unwrap(), ReadOutcome::Unwritten);
    assert_eq!(
        unit.write(0, EntryMetadata::unscoped(), b"fresh".to_vec())
            .unwrap(),
        WriteOutcome::Accepted
    );
}
