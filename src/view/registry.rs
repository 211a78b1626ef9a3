use super::LayoutError;
use crate::logunit::{InMemoryLogUnit, LogUnit};
use crate::sequencer::{InMemorySequencer, Sequencer};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type LogUnitFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn LogUnit>, LayoutError> + Send + Sync>;
type SequencerFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Sequencer>, LayoutError> + Send + Sync>;

/// Explicit backend registry mapping protocol names to node constructors.
///
/// Passed at runtime construction with runtime-instance lifetime; there is
/// deliberately no process-wide static. Locators look like
/// `"memory:unit-a"`: a protocol prefix, then a backend-specific name.
pub struct ProtocolRegistry {
    log_units: Mutex<HashMap<String, LogUnitFactory>>,
    sequencers: Mutex<HashMap<String, SequencerFactory>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            log_units: Mutex::new(HashMap::new()),
            sequencers: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the `memory` protocol wired to a shared node directory,
    /// so every resolution of the same locator yields the same node.
    pub fn with_memory_defaults() -> Self {
        let registry = Self::new();
        let directory = MemoryNodeDirectory::new();
        registry.register_memory(directory);
        registry
    }

    pub fn register_memory(&self, directory: MemoryNodeDirectory) {
        let units = directory.clone();
        self.register_log_unit("memory", move |name| Ok(units.log_unit(name)));
        self.register_sequencer("memory", move |name| Ok(directory.sequencer(name)));
    }

    pub fn register_log_unit<F>(&self, protocol: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn LogUnit>, LayoutError> + Send + Sync + 'static,
    {
        self.log_units
            .lock()
            .insert(protocol.to_string(), Arc::new(factory));
    }

    pub fn register_sequencer<F>(&self, protocol: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn Sequencer>, LayoutError> + Send + Sync + 'static,
    {
        self.sequencers
            .lock()
            .insert(protocol.to_string(), Arc::new(factory));
    }

    pub fn log_unit(&self, locator: &str) -> Result<Arc<dyn LogUnit>, LayoutError> {
        let (protocol, name) = split_locator(locator)?;
        let factory = self
            .log_units
            .lock()
            .get(protocol)
            .cloned()
            .ok_or_else(|| LayoutError::UnknownProtocol(locator.to_string()))?;
        debug!("event=registry_resolve kind=log_unit locator={locator}");
        factory(name)
    }

    pub fn sequencer(&self, locator: &str) -> Result<Arc<dyn Sequencer>, LayoutError> {
        let (protocol, name) = split_locator(locator)?;
        let factory = self
            .sequencers
            .lock()
            .get(protocol)
            .cloned()
            .ok_or_else(|| LayoutError::UnknownProtocol(locator.to_string()))?;
        debug!("event=registry_resolve kind=sequencer locator={locator}");
        factory(name)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_memory_defaults()
    }
}

fn split_locator(locator: &str) -> Result<(&str, &str), LayoutError> {
    locator
        .split_once(':')
        .filter(|(protocol, name)| !protocol.is_empty() && !name.is_empty())
        .ok_or_else(|| LayoutError::MalformedLocator(locator.to_string()))
}

/// Named in-memory nodes shared across locator resolutions, so that the
/// same locator in two layers (or two views) is the same storage.
#[derive(Clone, Default)]
pub struct MemoryNodeDirectory {
    log_units: Arc<Mutex<HashMap<String, Arc<InMemoryLogUnit>>>>,
    sequencers: Arc<Mutex<HashMap<String, Arc<InMemorySequencer>>>>,
}

impl MemoryNodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_unit(&self, name: &str) -> Arc<dyn LogUnit> {
        self.log_units
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryLogUnit::new()))
            .clone()
    }

    /// The concrete node, for tests and the inspection surface.
    pub fn raw_log_unit(&self, name: &str) -> Arc<InMemoryLogUnit> {
        self.log_units
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryLogUnit::new()))
            .clone()
    }

    pub fn insert_log_unit(&self, name: &str, unit: Arc<InMemoryLogUnit>) {
        self.log_units.lock().insert(name.to_string(), unit);
    }

    pub fn sequencer(&self, name: &str) -> Arc<dyn Sequencer> {
        self.sequencers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemorySequencer::new()))
            .clone()
    }

    /// Drops every node. Test isolation helper.
    pub fn clear(&self) {
        self.log_units.lock().clear();
        self.sequencers.lock().clear();
    }
}
