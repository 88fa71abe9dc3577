//! Explicit registry of worker types.
//!
//! Subtypes are registered under their type tag at program start; the CLI
//! looks the tag up to construct the matching infrastructure backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::Infrastructure;

type InfrastructureFactory = Box<dyn Fn() -> Arc<dyn Infrastructure> + Send + Sync>;

/// Maps worker type tags to infrastructure constructors.
#[derive(Default)]
pub struct WorkerTypeRegistry {
    factories: BTreeMap<String, InfrastructureFactory>,
}

impl WorkerTypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under a type tag, replacing any previous one.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Infrastructure> + Send + Sync + 'static,
    ) {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    /// Constructs the backend registered under `kind`, if any.
    pub fn create(&self, kind: &str) -> Option<Arc<dyn Infrastructure>> {
        self.factories.get(kind).map(|factory| factory())
    }

    /// Registered type tags, in order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
