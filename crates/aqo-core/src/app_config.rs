use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Key selection strategy used by the credential pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    #[default]
    RoundRobin,
    LeastRecentlyUsed,
    HealthWeighted,
}

impl FromStr for KeyStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(KeyStrategy::RoundRobin),
            "least_recently_used" | "lru" => Ok(KeyStrategy::LeastRecentlyUsed),
            "health_weighted" => Ok(KeyStrategy::HealthWeighted),
            other => Err(ConfigError::InvalidEnvVar {
                var: "AQO_KEY_STRATEGY".to_string(),
                reason: format!("unknown strategy '{other}'"),
            }),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub env: Environment,
    pub log_level: String,
    pub collectors_path: PathBuf,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub batch_size: usize,
    pub inter_batch_cooldown_ms: u64,
    pub poll_interval_secs: u64,
    pub poll_max_wait_secs: u64,
    pub sweep_interval_secs: u64,
    pub stale_after_secs: u64,
    pub stale_fail_after_secs: u64,
    pub key_strategy: KeyStrategy,
    pub key_cooldown_secs: u64,
    pub key_error_threshold: u32,
    pub collect_cron: String,
    pub http_user_agent: String,
    pub analysis_url: Option<String>,
    pub analysis_service: String,
}

impl AppConfig {
    #[must_use]
    pub fn inter_batch_cooldown(&self) -> Duration {
        Duration::from_millis(self.inter_batch_cooldown_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn poll_max_wait(&self) -> Duration {
        Duration::from_secs(self.poll_max_wait_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub fn key_cooldown(&self) -> Duration {
        Duration::from_secs(self.key_cooldown_secs)
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("log_level", &self.log_level)
            .field("collectors_path", &self.collectors_path)
            .field("database_url", &"[redacted]")
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("batch_size", &self.batch_size)
            .field("inter_batch_cooldown_ms", &self.inter_batch_cooldown_ms)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("poll_max_wait_secs", &self.poll_max_wait_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("stale_after_secs", &self.stale_after_secs)
            .field("stale_fail_after_secs", &self.stale_fail_after_secs)
            .field("key_strategy", &self.key_strategy)
            .field("key_cooldown_secs", &self.key_cooldown_secs)
            .field("key_error_threshold", &self.key_error_threshold)
            .field("collect_cron", &self.collect_cron)
            .field("http_user_agent", &self.http_user_agent)
            .field("analysis_url", &self.analysis_url)
            .field("analysis_service", &self.analysis_service)
            .finish()
    }
}
