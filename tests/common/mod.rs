#![allow(dead_code)]

use plexlog::{
    CachingViewProvider, ChainReplication, InMemoryLayoutSource, LayoutDocument, LayoutSource,
    MemoryNodeDirectory, ProtocolRegistry, RetryPolicy, Sequencer, ViewProvider,
};
use std::sync::Arc;
use std::time::Duration;

/// An in-process cluster: named memory nodes behind a two-layer layout,
/// one sequencer, one replication chain.
pub struct TestCluster {
    pub directory: MemoryNodeDirectory,
    pub registry: Arc<ProtocolRegistry>,
    pub source: Arc<InMemoryLayoutSource>,
    pub provider: Arc<dyn ViewProvider>,
    pub chain: Arc<ChainReplication>,
    pub sequencer: Arc<dyn Sequencer>,
    pub layer0: Vec<String>,
    pub layer1: Vec<String>,
}

pub fn cluster(layer0_nodes: usize, layer1_nodes: usize) -> TestCluster {
    let registry = Arc::new(ProtocolRegistry::new());
    let directory = MemoryNodeDirectory::new();
    registry.register_memory(directory.clone());
    let layer0: Vec<String> = (0..layer0_nodes).map(|i| format!("memory:l0-{i}")).collect();
    let layer1: Vec<String> = (0..layer1_nodes).map(|i| format!("memory:l1-{i}")).collect();
    let source = Arc::new(InMemoryLayoutSource::new(LayoutDocument::single_segment(
        1,
        vec![layer0.clone(), layer1.clone()],
    )));
    let provider: Arc<dyn ViewProvider> = Arc::new(CachingViewProvider::new(
        Arc::clone(&source) as Arc<dyn LayoutSource>,
        Arc::clone(&registry),
    ));
    let chain = Arc::new(ChainReplication::with_retry(
        Arc::clone(&provider),
        RetryPolicy::new(5, Duration::from_millis(1)),
    ));
    let sequencer = registry.sequencer("memory:sequencer").unwrap();
    TestCluster {
        directory,
        registry,
        source,
        provider,
        chain,
        sequencer,
        layer0,
        layer1,
    }
}
