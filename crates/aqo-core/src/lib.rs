//! Shared domain types and configuration for the answer query orchestrator.

pub mod analysis;
pub mod app_config;
pub mod collectors;
pub mod config;
pub mod credentials;
pub mod execution;
pub mod keys;
pub mod query;
pub mod result;

use thiserror::Error;

pub use analysis::{CachedAnalysis, EntityMention, Sentiment};
pub use app_config::{AppConfig, Environment, KeyStrategy};
pub use collectors::{
    load_collectors, CollectorConfig, CollectorsFile, ProviderConfig, ProviderKind, ProviderPlan,
};
pub use config::{load_app_config, load_app_config_from_env};
pub use credentials::{load_credentials, CredentialConfig, OperationKeys};
pub use execution::{ErrorClass, Execution, ExecutionError, ExecutionStatus, ExecutionStatusView};
pub use keys::{ApiKeyState, KeyHealth};
pub use query::{CollectorType, Query};
pub use result::{AnswerPayload, Citation, ResultRecord};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown collector type: {0}")]
    UnknownCollector(String),

    #[error("unknown execution status: {0}")]
    UnknownStatus(String),

    #[error("unknown key health: {0}")]
    UnknownKeyHealth(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },

    #[error("failed to read collectors file {path}: {source}")]
    CollectorsFileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse collectors file: {0}")]
    CollectorsFileParse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}
