//! Credential configuration for the per-operation key pool.
//!
//! Keys come from `AQO_KEYS_<OPERATION>` (comma-separated) and the designated
//! fallback from `AQO_FALLBACK_KEY_<OPERATION>`. Operation names are
//! lower-cased so they match the `service` field of provider configs.

use std::collections::BTreeMap;

use crate::ConfigError;

const KEYS_PREFIX: &str = "AQO_KEYS_";
const FALLBACK_PREFIX: &str = "AQO_FALLBACK_KEY_";

#[derive(Clone, Default, PartialEq, Eq)]
pub struct OperationKeys {
    pub keys: Vec<String>,
    pub fallback: Option<String>,
}

impl std::fmt::Debug for OperationKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationKeys")
            .field("keys", &self.keys.len())
            .field("fallback", &self.fallback.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialConfig {
    pub operations: BTreeMap<String, OperationKeys>,
}

impl CredentialConfig {
    #[must_use]
    pub fn get(&self, operation: &str) -> Option<&OperationKeys> {
        self.operations.get(operation)
    }
}

/// Read credentials from the process environment.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] if an operation has a fallback key but
/// no pooled keys.
pub fn load_credentials() -> Result<CredentialConfig, ConfigError> {
    build_credentials(std::env::vars())
}

/// Build credentials from arbitrary `(name, value)` pairs.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] if an operation has a fallback key but
/// no pooled keys.
pub fn build_credentials<I>(vars: I) -> Result<CredentialConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut operations: BTreeMap<String, OperationKeys> = BTreeMap::new();

    for (name, value) in vars {
        if let Some(op) = name.strip_prefix(KEYS_PREFIX) {
            let keys: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            operations.entry(op.to_lowercase()).or_default().keys = keys;
        } else if let Some(op) = name.strip_prefix(FALLBACK_PREFIX) {
            let key = value.trim();
            if !key.is_empty() {
                operations.entry(op.to_lowercase()).or_default().fallback = Some(key.to_string());
            }
        }
    }

    for (op, keys) in &operations {
        if keys.keys.is_empty() {
            return Err(ConfigError::Validation(format!(
                "operation '{op}' has no keys; set {KEYS_PREFIX}{}",
                op.to_uppercase()
            )));
        }
    }

    Ok(CredentialConfig { operations })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn parses_keys_and_fallback_per_operation() {
        let cfg = build_credentials(vars(&[
            ("AQO_KEYS_OPENAI", "k1, k2,k3"),
            ("AQO_FALLBACK_KEY_OPENAI", "fb"),
            ("AQO_KEYS_SERPAPI", "s1"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();

        let openai = cfg.get("openai").unwrap();
        assert_eq!(openai.keys, vec!["k1", "k2", "k3"]);
        assert_eq!(openai.fallback.as_deref(), Some("fb"));

        let serp = cfg.get("serpapi").unwrap();
        assert_eq!(serp.keys, vec!["s1"]);
        assert!(serp.fallback.is_none());
        assert_eq!(cfg.operations.len(), 2);
    }

    #[test]
    fn fallback_without_keys_is_rejected() {
        let err = build_credentials(vars(&[("AQO_FALLBACK_KEY_GEMINI", "fb")])).unwrap_err();
        assert!(err.to_string().contains("AQO_KEYS_GEMINI"));
    }

    #[test]
    fn debug_does_not_print_secrets() {
        let cfg = build_credentials(vars(&[
            ("AQO_KEYS_OPENAI", "sk-secret"),
            ("AQO_FALLBACK_KEY_OPENAI", "sk-fallback"),
        ]))
        .unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("sk-fallback"));
    }
}
