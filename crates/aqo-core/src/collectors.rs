//! Collector and provider topology loaded from `config/collectors.yaml`.
//!
//! Each collector lists the providers able to serve it. At the start of a run
//! the file is resolved into a [`ProviderPlan`]: concrete provider lists
//! sorted by ascending priority with disabled providers removed, plus the
//! per-brand overrides.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::query::CollectorType;
use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Returns the answer in the response.
    #[default]
    Sync,
    /// Returns a job handle; the answer is fetched later by the poller.
    Async,
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Key-pool operation this provider draws credentials from.
    pub service: String,
    pub endpoint: String,
    #[serde(default)]
    pub status_endpoint: Option<String>,
    pub priority: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub fallback_on_failure: bool,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.kind == ProviderKind::Async
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandOverride {
    pub brand_id: Uuid,
    #[serde(default)]
    pub disabled_providers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorsFile {
    pub collectors: BTreeMap<CollectorType, CollectorConfig>,
    #[serde(default)]
    pub brand_overrides: Vec<BrandOverride>,
}

impl CollectorsFile {
    /// Resolve into the per-run provider plan.
    #[must_use]
    pub fn resolve(&self) -> ProviderPlan {
        let chains = self
            .collectors
            .iter()
            .map(|(collector, cfg)| {
                let providers = cfg
                    .providers
                    .iter()
                    .filter(|p| p.enabled)
                    .cloned()
                    .collect();
                (*collector, providers)
            })
            .collect();

        self.brand_overrides
            .iter()
            .fold(ProviderPlan::new(chains), |plan, o| {
                plan.with_brand_override(o.brand_id, o.disabled_providers.iter().cloned())
            })
    }
}

/// Concrete, ordered provider lists for one run.
#[derive(Debug, Clone, Default)]
pub struct ProviderPlan {
    chains: BTreeMap<CollectorType, Vec<ProviderConfig>>,
    disabled_by_brand: HashMap<Uuid, HashSet<String>>,
}

impl ProviderPlan {
    /// Builds a plan, sorting every chain by ascending priority.
    #[must_use]
    pub fn new(mut chains: BTreeMap<CollectorType, Vec<ProviderConfig>>) -> Self {
        for providers in chains.values_mut() {
            providers.sort_by_key(|p| p.priority);
        }
        Self {
            chains,
            disabled_by_brand: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_brand_override<I>(mut self, brand_id: Uuid, disabled: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.disabled_by_brand
            .entry(brand_id)
            .or_default()
            .extend(disabled);
        self
    }

    /// Providers to attempt for `collector` on behalf of `brand_id`, in order.
    #[must_use]
    pub fn chain_for(&self, brand_id: Uuid, collector: CollectorType) -> Vec<ProviderConfig> {
        let disabled = self.disabled_by_brand.get(&brand_id);
        self.chains
            .get(&collector)
            .map(|providers| {
                providers
                    .iter()
                    .filter(|p| disabled.is_none_or(|d| !d.contains(&p.name)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every key-pool operation referenced by some provider.
    #[must_use]
    pub fn services(&self) -> BTreeSet<&str> {
        self.chains
            .values()
            .flatten()
            .map(|p| p.service.as_str())
            .collect()
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.chains.values().flatten()
    }
}

/// Load and validate the collectors configuration from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
pub fn load_collectors(path: &Path) -> Result<CollectorsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::CollectorsFileIo {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut file: CollectorsFile = serde_yaml::from_str(&content)?;
    normalize_services(&mut file);
    validate_collectors(&file)?;
    Ok(file)
}

/// Credential operations are read from env var suffixes in lower case, so
/// service names are matched the same way.
fn normalize_services(file: &mut CollectorsFile) {
    for provider in file
        .collectors
        .values_mut()
        .flat_map(|cfg| cfg.providers.iter_mut())
    {
        provider.service = provider.service.trim().to_lowercase();
    }
}

fn validate_collectors(file: &CollectorsFile) -> Result<(), ConfigError> {
    let mut seen_names = HashSet::new();

    for (collector, cfg) in &file.collectors {
        let mut seen_priorities = HashSet::new();

        for provider in &cfg.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "collector '{collector}' has a provider with an empty name"
                )));
            }

            if !seen_names.insert(provider.name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate provider name: '{}'",
                    provider.name
                )));
            }

            if provider.service.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "provider '{}' must name a service",
                    provider.name
                )));
            }

            if provider.endpoint.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "provider '{}' must have an endpoint",
                    provider.name
                )));
            }

            if provider.timeout_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "provider '{}' has timeout_ms 0; must be positive",
                    provider.name
                )));
            }

            if provider.is_async() && provider.status_endpoint.is_none() {
                return Err(ConfigError::Validation(format!(
                    "async provider '{}' requires a status_endpoint",
                    provider.name
                )));
            }

            if !seen_priorities.insert(provider.priority) {
                return Err(ConfigError::Validation(format!(
                    "collector '{collector}' has duplicate priority {} (provider '{}')",
                    provider.priority, provider.name
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "collectors_test.rs"]
mod tests;
