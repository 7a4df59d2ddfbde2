//! Query execution orchestration: batching, collector fan-out, provider
//! fallback, async polling, self-healing status reconciliation, credential
//! pooling and the consolidated analysis cache.

pub mod batcher;
pub mod cache;
pub mod chain;
pub mod dispatcher;
pub mod error;
pub mod key_pool;
pub mod orchestrator;
pub mod pg_store;
pub mod poller;
pub(crate) mod retry;
pub mod store;
pub mod tracker;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;

pub use batcher::{plan_batches, BatchSummary, QueryBatcher};
pub use cache::ResultCache;
pub use chain::{ChainOutcome, ProviderChain};
pub use dispatcher::{CollectorDispatcher, CollectorOutcome, Disposition, QueryOutcome};
pub use error::{CacheError, KeyPoolError, OrchestratorError, StoreError};
pub use key_pool::{fingerprint, KeyLease, KeyPool, KeyPoolConfig};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use pg_store::PgStore;
pub use poller::{AsyncPoller, PollerConfig};
pub use store::{
    AnalysisStore, CollectionRun, ExecutionStore, MemoryStore, RunStatus, TransitionPatch,
};
pub use tracker::ExecutionTracker;
pub use verifier::{SweepReport, Verifier, WatchedExecutions};
