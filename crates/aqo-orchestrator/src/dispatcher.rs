//! Fans one query out to every enabled collector.
//!
//! Collectors run concurrently and independently: each one gets its
//! execution row before any provider is contacted, runs its own fallback
//! chain, and settles on its own. A failing collector never cancels or
//! delays a sibling.

use std::sync::Arc;

use aqo_core::{
    CollectorType, ErrorClass, Execution, ExecutionError, ExecutionStatus, ProviderPlan, Query,
};
use aqo_providers::AnswerRequest;
use futures::future::join_all;
use uuid::Uuid;

use crate::chain::{ChainOutcome, ProviderChain};
use crate::error::StoreError;
use crate::poller::AsyncPoller;
use crate::tracker::ExecutionTracker;
use crate::verifier::Verifier;

/// How one collector attempt ended, as far as the dispatcher can tell.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Completed { result_id: Uuid },
    /// Handed to the poller; the execution is `running`.
    Deferred,
    Failed(ExecutionError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorOutcome {
    pub collector: CollectorType,
    /// `None` when the execution row itself could not be created.
    pub execution_id: Option<Uuid>,
    pub disposition: Disposition,
}

impl CollectorOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self.disposition, Disposition::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub query_id: Uuid,
    pub collectors: Vec<CollectorOutcome>,
}

impl QueryOutcome {
    /// A query succeeds when at least one collector completed or was deferred.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.collectors.iter().any(CollectorOutcome::is_success)
    }

    #[must_use]
    pub fn execution_ids(&self) -> Vec<Uuid> {
        self.collectors.iter().filter_map(|c| c.execution_id).collect()
    }
}

#[derive(Clone)]
pub struct CollectorDispatcher {
    plan: Arc<ProviderPlan>,
    chain: ProviderChain,
    tracker: ExecutionTracker,
    verifier: Verifier,
    poller: AsyncPoller,
}

impl CollectorDispatcher {
    #[must_use]
    pub fn new(
        plan: Arc<ProviderPlan>,
        chain: ProviderChain,
        tracker: ExecutionTracker,
        verifier: Verifier,
        poller: AsyncPoller,
    ) -> Self {
        Self {
            plan,
            chain,
            tracker,
            verifier,
            poller,
        }
    }

    /// Runs every distinct enabled collector of `query` concurrently and
    /// waits for all of them to settle.
    pub async fn dispatch(&self, run_id: Uuid, query: &Query) -> QueryOutcome {
        let collectors = query.distinct_collectors();
        if collectors.is_empty() {
            tracing::warn!(query_id = %query.id, "query has no enabled collectors");
        }

        let outcomes = join_all(
            collectors
                .into_iter()
                .map(|collector| self.run_collector(run_id, query, collector)),
        )
        .await;

        QueryOutcome {
            query_id: query.id,
            collectors: outcomes,
        }
    }

    async fn run_collector(
        &self,
        run_id: Uuid,
        query: &Query,
        collector: CollectorType,
    ) -> CollectorOutcome {
        match self.try_run_collector(run_id, query, collector).await {
            Ok(outcome) => outcome,
            Err((execution_id, e)) => {
                tracing::error!(
                    query_id = %query.id,
                    collector = %collector,
                    error = %e,
                    "collector aborted by store error"
                );
                CollectorOutcome {
                    collector,
                    execution_id,
                    disposition: Disposition::Failed(ExecutionError::new(
                        None,
                        ErrorClass::PersistenceFailure,
                        e.to_string(),
                    )),
                }
            }
        }
    }

    async fn try_run_collector(
        &self,
        run_id: Uuid,
        query: &Query,
        collector: CollectorType,
    ) -> Result<CollectorOutcome, (Option<Uuid>, StoreError)> {
        let exec = self
            .tracker
            .begin(run_id, query.id, collector)
            .await
            .map_err(|e| (None, e))?;
        let id = exec.id;
        let outcome = |disposition| CollectorOutcome {
            collector,
            execution_id: Some(id),
            disposition,
        };

        if exec.status.is_terminal() {
            tracing::debug!(execution_id = %id, status = %exec.status, "execution already settled");
            return Ok(outcome(settled_disposition(&exec)));
        }
        if !self.tracker.mark_running(id).await.map_err(|e| (Some(id), e))? {
            let current = self
                .tracker
                .store()
                .get_execution(id)
                .await
                .map_err(|e| (Some(id), e))?;
            return Ok(outcome(
                current.as_ref().map_or(Disposition::Deferred, settled_disposition),
            ));
        }

        let request = AnswerRequest {
            execution_id: id,
            query_id: query.id,
            brand_id: query.brand_id,
            collector,
            query: query.text.clone(),
        };
        let providers = self.plan.chain_for(query.brand_id, collector);

        match self.chain.run(&request, &providers).await {
            ChainOutcome::Answered { payload, .. } => {
                let stored = self
                    .tracker
                    .record_result(id, &payload)
                    .await
                    .map_err(|e| (Some(id), e))?;
                if let Err(e) = self.verifier.verify_execution(id).await {
                    tracing::warn!(
                        execution_id = %id,
                        error = %e,
                        "post-write verification failed"
                    );
                }
                if stored.is_usable() {
                    Ok(outcome(Disposition::Completed { result_id: stored.id }))
                } else {
                    Ok(outcome(Disposition::Failed(ExecutionError::new(
                        None,
                        ErrorClass::CapturedFailure,
                        stored.failure.unwrap_or_default(),
                    ))))
                }
            }
            ChainOutcome::Deferred { provider, job } => {
                // The stale clock starts at hand-off, not at dispatch.
                if let Err(e) = self.tracker.touch(id).await {
                    tracing::warn!(
                        execution_id = %id,
                        error = %e,
                        "could not refresh execution before polling"
                    );
                }
                if self.poller.watch(id, provider.clone(), job) {
                    Ok(outcome(Disposition::Deferred))
                } else {
                    let error = ExecutionError::new(
                        Some(&provider.name),
                        ErrorClass::AsyncJobAbandoned,
                        "orchestrator shutting down before job could be polled",
                    );
                    self.tracker
                        .fail(id, error.clone())
                        .await
                        .map_err(|e| (Some(id), e))?;
                    Ok(outcome(Disposition::Failed(error)))
                }
            }
            ChainOutcome::Exhausted(error) => {
                self.tracker
                    .fail(id, error.clone())
                    .await
                    .map_err(|e| (Some(id), e))?;
                Ok(outcome(Disposition::Failed(error)))
            }
        }
    }
}

fn settled_disposition(exec: &Execution) -> Disposition {
    match (exec.status, exec.result_id) {
        (ExecutionStatus::Completed, Some(result_id)) => Disposition::Completed { result_id },
        (ExecutionStatus::Failed, _) | (ExecutionStatus::Completed, None) => {
            Disposition::Failed(exec.error.clone().unwrap_or_else(|| {
                ExecutionError::new(
                    None,
                    ErrorClass::PersistenceFailure,
                    "settled without a reason",
                )
            }))
        }
        _ => Disposition::Deferred,
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod tests;
