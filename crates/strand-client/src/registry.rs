//! Module Registry — build-assigned executable unit ids to named exports.
//!
//! Populated as executable units finish loading, before or after the
//! stream starts; the order is not guaranteed. Entries are only ever
//! added, never mutated, so reads need no lock (DashMap gives lock-free
//! reads). The registry is never cleared: a full bundle swap replaces it
//! wholesale through [`RegistrySlot`].

use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use strand_core::Value;

/// Mapping from (chunk id, export name) to the export's runtime value.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    exports: DashMap<(u32, String), Value>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one loaded export. Append-only between swaps.
    pub fn register(&self, chunk_id: u32, export: impl Into<String>, value: Value) {
        let export = export.into();
        tracing::debug!(chunk_id, export = %export, "module export registered");
        self.exports.insert((chunk_id, export), value);
    }

    pub fn lookup(&self, chunk_id: u32, export: &str) -> Option<Value> {
        self.exports
            .get(&(chunk_id, export.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

/// The slot that owns the current registry.
///
/// Resolvers read through it; only the bundle swapper replaces it, and
/// only wholesale. The write lock is held for a pointer swap, never
/// across a lookup.
#[derive(Debug, Clone)]
pub struct RegistrySlot {
    inner: Arc<RwLock<Arc<ModuleRegistry>>>,
}

impl RegistrySlot {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub fn current(&self) -> Arc<ModuleRegistry> {
        self.inner.read().expect("registry slot poisoned").clone()
    }

    /// Swap in a fresh registry. The old one stays alive for readers that
    /// already hold it but receives no further entries.
    pub fn replace(&self, registry: Arc<ModuleRegistry>) {
        let mut slot = self.inner.write().expect("registry slot poisoned");
        tracing::info!(
            old_exports = slot.len(),
            new_exports = registry.len(),
            "module registry replaced"
        );
        *slot = registry;
    }
}

impl Default for RegistrySlot {
    fn default() -> Self {
        Self::new(Arc::new(ModuleRegistry::new()))
    }
}
