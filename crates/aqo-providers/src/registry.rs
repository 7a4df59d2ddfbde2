//! Provider backends keyed by provider name.

use std::collections::HashMap;
use std::sync::Arc;

use aqo_core::ProviderPlan;
use reqwest::Client;

use crate::backend::ProviderBackend;
use crate::client::HttpProvider;
use crate::error::ProviderError;

#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ProviderBackend>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an [`HttpProvider`] for every provider in `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidEndpoint`] if any provider's endpoint
    /// cannot be parsed.
    pub fn from_plan(plan: &ProviderPlan, client: &Client) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        for config in plan.providers() {
            let backend = HttpProvider::new(client.clone(), config)?;
            registry.insert(config.name.clone(), Arc::new(backend));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, backend: Arc<dyn ProviderBackend>) {
        self.backends.insert(name.into(), backend);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderBackend>> {
        self.backends.get(name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("BackendRegistry")
            .field("providers", &names)
            .finish()
    }
}
