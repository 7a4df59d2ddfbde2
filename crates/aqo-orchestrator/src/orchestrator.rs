//! The public entry point: batch submission, status lookup and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use aqo_core::{ApiKeyState, AppConfig, ExecutionStatusView, ProviderPlan, Query};
use aqo_providers::{AnalysisBackend, BackendRegistry};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::batcher::{BatchSummary, QueryBatcher};
use crate::cache::ResultCache;
use crate::chain::ProviderChain;
use crate::dispatcher::CollectorDispatcher;
use crate::error::OrchestratorError;
use crate::key_pool::KeyPool;
use crate::poller::{AsyncPoller, PollerConfig};
use crate::store::{AnalysisStore, CollectionRun, ExecutionStore};
use crate::tracker::ExecutionTracker;
use crate::verifier::{SweepReport, Verifier};

const DEFAULT_TRIGGER: &str = "api";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub batch_size: usize,
    pub inter_batch_cooldown: Duration,
    pub poller: PollerConfig,
    pub stale_after: Duration,
    pub stale_fail_after: Duration,
    /// Key-pool operation used by the result cache.
    pub analysis_service: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            batch_size: 3,
            inter_batch_cooldown: Duration::from_secs(1),
            poller: PollerConfig::default(),
            stale_after: Duration::from_secs(300),
            stale_fail_after: Duration::from_secs(600),
            analysis_service: "analysis".to_owned(),
        }
    }
}

impl OrchestratorSettings {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            inter_batch_cooldown: config.inter_batch_cooldown(),
            poller: PollerConfig::from_app_config(config),
            stale_after: Duration::from_secs(config.stale_after_secs),
            stale_fail_after: Duration::from_secs(config.stale_fail_after_secs),
            analysis_service: config.analysis_service.clone(),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    keys: Arc<KeyPool>,
    batcher: QueryBatcher,
    verifier: Verifier,
    poller: AsyncPoller,
    cache: ResultCache,
    active: TaskTracker,
}

impl Orchestrator {
    /// Wires every component over one shared store.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidBatchSize`] if
    /// `settings.batch_size` is zero.
    pub fn new<S>(
        store: Arc<S>,
        plan: ProviderPlan,
        backends: BackendRegistry,
        keys: Arc<KeyPool>,
        analysis: Option<Arc<dyn AnalysisBackend>>,
        settings: OrchestratorSettings,
    ) -> Result<Self, OrchestratorError>
    where
        S: ExecutionStore + AnalysisStore + 'static,
    {
        let executions: Arc<dyn ExecutionStore> = Arc::clone(&store) as Arc<dyn ExecutionStore>;
        let analyses: Arc<dyn AnalysisStore> = store;
        let backends = Arc::new(backends);

        let tracker = ExecutionTracker::new(Arc::clone(&executions));
        let verifier = Verifier::new(
            Arc::clone(&executions),
            settings.stale_after,
            settings.stale_fail_after,
        );
        let poller = AsyncPoller::new(
            Arc::clone(&keys),
            Arc::clone(&backends),
            tracker.clone(),
            verifier.clone(),
            settings.poller,
        );
        let dispatcher = CollectorDispatcher::new(
            Arc::new(plan),
            ProviderChain::new(Arc::clone(&keys), backends),
            tracker,
            verifier.clone(),
            poller.clone(),
        );
        let batcher = QueryBatcher::new(
            dispatcher,
            verifier.clone(),
            settings.batch_size,
            settings.inter_batch_cooldown,
        )?;
        let cache = ResultCache::new(
            Arc::clone(&executions),
            analyses,
            analysis,
            Arc::clone(&keys),
            settings.analysis_service,
        );

        Ok(Self {
            store: executions,
            keys,
            batcher,
            verifier,
            poller,
            cache,
            active: TaskTracker::new(),
        })
    }

    /// Runs `queries` to completion as one collection run.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ShuttingDown`] after [`Self::shutdown`],
    /// or [`OrchestratorError::Store`] when the store is unreachable.
    /// Individual query failures are counted in the summary instead.
    pub async fn submit_batch(&self, queries: &[Query]) -> Result<BatchSummary, OrchestratorError> {
        self.submit_batch_with_trigger(queries, DEFAULT_TRIGGER).await
    }

    /// [`Self::submit_batch`] with the run's trigger source recorded.
    ///
    /// # Errors
    ///
    /// See [`Self::submit_batch`].
    pub async fn submit_batch_with_trigger(
        &self,
        queries: &[Query],
        trigger: &str,
    ) -> Result<BatchSummary, OrchestratorError> {
        if self.active.is_closed() {
            return Err(OrchestratorError::ShuttingDown);
        }
        self.active.track_future(self.run_collection(queries, trigger)).await
    }

    async fn run_collection(
        &self,
        queries: &[Query],
        trigger: &str,
    ) -> Result<BatchSummary, OrchestratorError> {
        self.store.ping().await?;

        let run_id = Uuid::new_v4();
        self.store.create_run(run_id, trigger, queries.len()).await?;
        self.store.start_run(run_id).await?;
        tracing::info!(
            run_id = %run_id,
            trigger,
            queries = queries.len(),
            "collection run started"
        );

        match self.batcher.run(run_id, queries).await {
            Ok(summary) => {
                self.store
                    .finish_run(run_id, summary.succeeded, summary.failed)
                    .await?;
                tracing::info!(
                    run_id = %run_id,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    batches = summary.batch_sizes.len(),
                    "collection run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(fail_err) = self.store.fail_run(run_id, &e.to_string()).await {
                    tracing::error!(
                        run_id = %run_id,
                        error = %fail_err,
                        "could not mark run failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when the store is unreachable.
    pub async fn get_execution_status(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionStatusView>, OrchestratorError> {
        Ok(self
            .store
            .get_execution(execution_id)
            .await?
            .as_ref()
            .map(ExecutionStatusView::from))
    }

    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when the store is unreachable.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, OrchestratorError> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// One pass of the periodic safety-net sweep.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when the stale listing fails.
    pub async fn sweep_once(&self) -> Result<SweepReport, OrchestratorError> {
        Ok(self.verifier.sweep().await?)
    }

    #[must_use]
    pub fn key_snapshot(&self) -> Vec<ApiKeyState> {
        self.keys.snapshot()
    }

    /// Returns an `error` key to service. `false` if no such key exists.
    pub fn reset_key(&self, operation: &str, fingerprint: &str) -> bool {
        self.keys.reset(operation, fingerprint)
    }

    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Async jobs still being polled.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.poller.in_flight()
    }

    /// Stops accepting batches, lets running batches finish, then drains the
    /// async pollers.
    pub async fn shutdown(&self) {
        self.active.close();
        if !self.active.is_empty() {
            tracing::info!(batches = self.active.len(), "waiting for running batches");
        }
        self.active.wait().await;
        self.poller.shutdown().await;
        tracing::info!("orchestrator stopped");
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;
