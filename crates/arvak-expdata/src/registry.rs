//! Registry mapping backend providers to experiment services.
//!
//! An experiment created without an explicit service looks up the provider
//! of its backend here, so experiments run on a provider's devices are saved
//! to that provider's database.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::service::ExperimentService;

/// Provider name to experiment service.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: FxHashMap<String, Arc<dyn ExperimentService>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the service of a provider, replacing any previous one.
    pub fn register(&mut self, provider: impl Into<String>, service: Arc<dyn ExperimentService>) {
        let provider = provider.into();
        debug!("Registering experiment service for provider: {}", provider);
        self.services.insert(provider, service);
    }

    /// Service of a provider.
    pub fn service_for(&self, provider: &str) -> Option<Arc<dyn ExperimentService>> {
        self.services.get(provider).cloned()
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
