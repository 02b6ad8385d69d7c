//! Backend registry
//!
//! An ordered catalog of [`BackendDescriptor`]s. Order is total and
//! deterministic: ascending priority, ties broken by registration order.
//! Failure state never lives here; re-iterating always starts from the top.

use super::BackendDescriptor;
use crate::error::{DispatchError, DispatchResult};
use std::sync::{Arc, OnceLock};

/// Ordered catalog of backends.
#[derive(Debug, Default, Clone)]
pub struct BackendRegistry {
    descriptors: Vec<BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor after every entry of equal or better priority.
    ///
    /// # Errors
    /// - `DuplicateBackend`: a descriptor with the same name is already registered
    pub fn register(&mut self, descriptor: BackendDescriptor) -> DispatchResult<()> {
        if self.get(descriptor.name()).is_some() {
            return Err(DispatchError::DuplicateBackend(descriptor.name().to_string()));
        }
        let at = self
            .descriptors
            .partition_point(|d| d.priority() <= descriptor.priority());
        tracing::debug!(
            backend = %descriptor.name(),
            priority = descriptor.priority(),
            position = at,
            "backend registered"
        );
        self.descriptors.insert(at, descriptor);
        Ok(())
    }

    /// Chainable form of [`register`](Self::register)
    pub fn with(mut self, descriptor: BackendDescriptor) -> DispatchResult<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    /// Descriptors in priority order. Each call starts from the top.
    pub fn candidates(&self) -> impl ExactSizeIterator<Item = &BackendDescriptor> + '_ {
        self.descriptors.iter()
    }

    pub fn get(&self, name: &str) -> Option<&BackendDescriptor> {
        self.descriptors.iter().find(|d| d.name() == name)
    }

    /// Registered names in priority order
    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ============================================================================
// Process-wide registry (optional)
// ============================================================================

static GLOBAL_REGISTRY: OnceLock<Arc<BackendRegistry>> = OnceLock::new();

/// Initialize the process-wide registry.
///
/// Idempotent: only the first call runs `init`; later calls return the
/// registry built by the first one.
pub fn init_global_registry(init: impl FnOnce() -> BackendRegistry) -> Arc<BackendRegistry> {
    GLOBAL_REGISTRY.get_or_init(|| Arc::new(init())).clone()
}

/// The process-wide registry, empty if it was never initialized.
pub fn global_registry() -> Arc<BackendRegistry> {
    init_global_registry(BackendRegistry::new)
}
