use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by an [`crate::ExecutionStore`] or [`crate::AnalysisStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] aqo_db::DbError),

    #[error("collection run {0} not found")]
    RunNotFound(Uuid),

    #[error("collection run {id} is not in expected status '{expected}'")]
    InvalidRunTransition { id: Uuid, expected: &'static str },

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),
}

#[derive(Debug, Error)]
pub enum KeyPoolError {
    #[error("no credentials configured for operation '{0}'")]
    UnknownOperation(String),

    #[error("every key for operation '{0}' is in error state and no fallback key is configured")]
    NoUsableKey(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("result {0} not found")]
    ResultNotFound(Uuid),

    #[error("no analysis backend configured")]
    NoBackend,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    KeyPool(#[from] KeyPoolError),

    #[error(transparent)]
    Provider(#[from] aqo_providers::ProviderError),
}

/// Infrastructure failures. Per-query and per-collector failures are
/// recorded on executions and never surface here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}
