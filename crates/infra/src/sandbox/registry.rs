//! Processors resolvable by path for thread-backed sandboxes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::processor::Processor;

/// Maps processor paths to in-process processors.
///
/// Thread-backed contexts look their processor up here when they receive
/// `Init`; an unknown path is answered with `InitFailed`.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register (or replace) the processor served under `path`.
    pub fn register(&self, path: impl Into<String>, processor: impl Processor + 'static) {
        self.register_arc(path, Arc::new(processor));
    }

    pub fn register_arc(&self, path: impl Into<String>, processor: Arc<dyn Processor>) {
        let mut processors = self
            .processors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        processors.insert(path.into(), processor);
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn Processor>> {
        self.processors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Resolve `path` or describe why it could not be.
    pub fn resolve(&self, path: &str) -> Result<Arc<dyn Processor>, String> {
        self.get(path)
            .ok_or_else(|| format!("no processor registered under '{path}'"))
    }
}

impl core::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let paths: Vec<String> = self
            .processors
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ProcessorRegistry").field("paths", &paths).finish()
    }
}
