mod common;

use common::cluster;
use plexlog::{
    CachingViewProvider, EntryMetadata, LayoutDocument, LayoutError, LayoutStore, ProtocolRegistry,
    ReadOutcome, ReadTarget, SegmentDocument, ViewProvider,
};
use std::sync::Arc;

#[test]
fn layout_survives_a_disk_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LayoutStore::new(dir.path().join("cluster").join("layout.json"));
    let document = LayoutDocument {
        epoch: 3,
        segments: vec![
            SegmentDocument {
                base: 0,
                layers: vec![vec!["memory:a".into()], vec!["memory:b".into()]],
            },
            SegmentDocument {
                base: 1000,
                layers: vec![vec!["memory:c".into()], vec!["memory:d".into()]],
            },
        ],
    };
    store.persist(&document).unwrap();
    assert_eq!(store.load().unwrap(), document);

    let registry = Arc::new(ProtocolRegistry::with_memory_defaults());
    let provider = CachingViewProvider::new(Arc::new(store), registry);
    let view = provider.current().unwrap();
    assert_eq!(view.epoch, 3);
    assert_eq!(view.segment_for(999).unwrap().base, 0);
    assert_eq!(view.segment_for(1000).unwrap().base, 1000);
}

#[test]
fn single_layer_segments_are_rejected() {
    let registry = Arc::new(ProtocolRegistry::with_memory_defaults());
    let source = Arc::new(plexlog::InMemoryLayoutSource::new(
        LayoutDocument::single_segment(1, vec![vec!["memory:only".into()]]),
    ));
    let provider = CachingViewProvider::new(source, registry);
    assert!(matches!(
        provider.current(),
        Err(LayoutError::TooFewLayers { base: 0, layers: 1 })
    ));
}

#[test]
fn published_reconfigurations_apply_after_invalidation() {
    let cluster = cluster(1, 1);
    cluster
        .chain
        .write(0, EntryMetadata::unscoped(), b"before".to_vec())
        .unwrap();

    // Same node set, later epoch: the cached view serves until invalidated.
    cluster.source.publish(LayoutDocument::single_segment(
        5,
        vec![cluster.layer0.clone(), cluster.layer1.clone()],
    ));
    assert_eq!(cluster.provider.current().unwrap().epoch, 1);
    cluster.provider.invalidate();
    assert_eq!(cluster.provider.current().unwrap().epoch, 5);

    // Data written under the old epoch is still routed correctly.
    assert!(matches!(
        cluster.chain.read(ReadTarget::Physical(0)).unwrap(),
        ReadOutcome::Data(_)
    ));

    // Epoch regressions are ignored outright.
    cluster.source.publish(LayoutDocument::single_segment(
        2,
        vec![cluster.layer0.clone(), cluster.layer1.clone()],
    ));
    cluster.provider.invalidate();
    assert_eq!(cluster.provider.current().unwrap().epoch, 5);
}
