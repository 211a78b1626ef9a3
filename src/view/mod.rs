//! Layout views: which log-unit nodes host which address ranges, as handed
//! down by the external config/view provider. The replication layer consumes
//! resolved views and invalidates them on stale-routing failures.

mod registry;

pub use registry::{MemoryNodeDirectory, ProtocolRegistry};

use crate::logunit::LogUnit;
use crate::types::Address;
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// One replication segment: an ordered list of layers, each a list of node
/// locators (`protocol:name`), owning addresses from `base` upward until the
/// next segment's base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDocument {
    pub base: Address,
    pub layers: Vec<Vec<String>>,
}

/// Serializable layout document published by the view provider. Epochs are
/// strictly increasing across reconfigurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutDocument {
    pub epoch: u64,
    pub segments: Vec<SegmentDocument>,
}

impl LayoutDocument {
    pub fn single_segment(epoch: u64, layers: Vec<Vec<String>>) -> Self {
        Self {
            epoch,
            segments: vec![SegmentDocument { base: 0, layers }],
        }
    }
}

/// A segment with its node locators resolved to live log-unit handles.
pub struct ResolvedSegment {
    pub base: Address,
    pub layers: Vec<Vec<Arc<dyn LogUnit>>>,
}

/// A resolved, immutable snapshot of the cluster layout.
pub struct LayoutView {
    pub epoch: u64,
    pub segments: Vec<ResolvedSegment>,
}

impl LayoutView {
    /// The segment owning `address`: the last segment whose base is at or
    /// below it.
    pub fn segment_for(&self, address: Address) -> Option<&ResolvedSegment> {
        self.segments
            .iter()
            .rev()
            .find(|segment| segment.base <= address)
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("no protocol registered for locator {0:?}")]
    UnknownProtocol(String),
    #[error("malformed node locator {0:?} (expected protocol:name)")]
    MalformedLocator(String),
    #[error("layout segment at base {base} needs at least two layers, found {layers}")]
    TooFewLayers { base: Address, layers: usize },
    #[error("layout has no segments")]
    Empty,
    #[error("layout I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("layout serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Source of layout documents, the external config-master seam.
pub trait LayoutSource: Send + Sync {
    fn fetch(&self) -> Result<LayoutDocument, LayoutError>;
}

/// In-process layout source whose document can be republished at any time,
/// standing in for the external config master in tests and embedded use.
pub struct InMemoryLayoutSource {
    document: Mutex<LayoutDocument>,
}

impl InMemoryLayoutSource {
    pub fn new(document: LayoutDocument) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    /// Publishes a reconfigured layout. Epoch regressions are ignored.
    pub fn publish(&self, document: LayoutDocument) {
        let mut current = self.document.lock();
        if document.epoch <= current.epoch {
            info!(
                "event=layout_publish_ignored epoch={} current={}",
                document.epoch, current.epoch
            );
            return;
        }
        info!("event=layout_publish epoch={}", document.epoch);
        *current = document;
    }
}

impl LayoutSource for InMemoryLayoutSource {
    fn fetch(&self) -> Result<LayoutDocument, LayoutError> {
        Ok(self.document.lock().clone())
    }
}

/// JSON-file layout store for bootstrap from disk.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    path: PathBuf,
}

impl LayoutStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<LayoutDocument, LayoutError> {
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn persist(&self, document: &LayoutDocument) -> Result<(), LayoutError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(document)?)?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

impl LayoutSource for LayoutStore {
    fn fetch(&self) -> Result<LayoutDocument, LayoutError> {
        self.load()
    }
}

/// Hands out the current resolved view and refetches after invalidation.
pub trait ViewProvider: Send + Sync {
    fn current(&self) -> Result<Arc<LayoutView>, LayoutError>;

    /// Drops the cached view so the next `current` refetches from the
    /// source. Swap is exclusive: no caller can observe a half-replaced
    /// view.
    fn invalidate(&self);
}

/// Caching provider over a layout source and a protocol registry.
pub struct CachingViewProvider {
    source: Arc<dyn LayoutSource>,
    registry: Arc<ProtocolRegistry>,
    cache: Mutex<Option<Arc<LayoutView>>>,
}

impl CachingViewProvider {
    pub fn new(source: Arc<dyn LayoutSource>, registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            source,
            registry,
            cache: Mutex::new(None),
        }
    }

    fn resolve(&self, document: &LayoutDocument) -> Result<LayoutView, LayoutError> {
        if document.segments.is_empty() {
            return Err(LayoutError::Empty);
        }
        let mut segments = Vec::with_capacity(document.segments.len());
        for segment in &document.segments {
            if segment.layers.len() < 2 {
                return Err(LayoutError::TooFewLayers {
                    base: segment.base,
                    layers: segment.layers.len(),
                });
            }
            let mut layers = Vec::with_capacity(segment.layers.len());
            for layer in &segment.layers {
                let mut nodes = Vec::with_capacity(layer.len());
                for locator in layer {
                    nodes.push(self.registry.log_unit(locator)?);
                }
                layers.push(nodes);
            }
            segments.push(ResolvedSegment {
                base: segment.base,
                layers,
            });
        }
        Ok(LayoutView {
            epoch: document.epoch,
            segments,
        })
    }
}

impl ViewProvider for CachingViewProvider {
    fn current(&self) -> Result<Arc<LayoutView>, LayoutError> {
        let mut cache = self.cache.lock();
        if let Some(view) = cache.as_ref() {
            return Ok(view.clone());
        }
        let document = self.source.fetch()?;
        let view = Arc::new(self.resolve(&document)?);
        info!("event=view_resolve epoch={}", view.epoch);
        *cache = Some(view.clone());
        Ok(view)
    }

    fn invalidate(&self) {
        info!("event=view_invalidate");
        self.cache.lock().take();
    }
}
