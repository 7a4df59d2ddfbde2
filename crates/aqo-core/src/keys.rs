use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyHealth {
    Healthy,
    RateLimited,
    Error,
}

impl KeyHealth {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KeyHealth::Healthy => "healthy",
            KeyHealth::RateLimited => "rate_limited",
            KeyHealth::Error => "error",
        }
    }
}

impl std::fmt::Display for KeyHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyHealth {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(KeyHealth::Healthy),
            "rate_limited" => Ok(KeyHealth::RateLimited),
            "error" => Ok(KeyHealth::Error),
            other => Err(CoreError::UnknownKeyHealth(other.to_string())),
        }
    }
}

/// Point-in-time view of one pooled credential.
///
/// `fingerprint` identifies the key in logs and snapshots; the secret itself
/// is never exposed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyState {
    pub operation: String,
    pub fingerprint: String,
    pub is_fallback: bool,
    pub status: KeyHealth,
    /// Milliseconds until the rate-limit cooldown elapses, if any.
    pub cooldown_remaining_ms: Option<u64>,
    pub success_count: u64,
    pub error_count: u64,
}
