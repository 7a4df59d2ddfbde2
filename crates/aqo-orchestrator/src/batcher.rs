//! Sequential batches of concurrently dispatched queries.

use std::time::Duration;

use aqo_core::Query;
use futures::future::join_all;
use uuid::Uuid;

use crate::dispatcher::{CollectorDispatcher, QueryOutcome};
use crate::error::OrchestratorError;
use crate::verifier::Verifier;

/// Splits `items` into `ceil(len / size)` ordered batches, each at most
/// `size` long.
///
/// # Errors
///
/// Returns [`OrchestratorError::InvalidBatchSize`] when `size` is zero.
pub fn plan_batches<T>(items: &[T], size: usize) -> Result<Vec<&[T]>, OrchestratorError> {
    if size == 0 {
        return Err(OrchestratorError::InvalidBatchSize);
    }
    Ok(items.chunks(size).collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Size of every batch, in processing order.
    pub batch_sizes: Vec<usize>,
}

#[derive(Clone)]
pub struct QueryBatcher {
    dispatcher: CollectorDispatcher,
    verifier: Verifier,
    batch_size: usize,
    cooldown: Duration,
}

impl QueryBatcher {
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidBatchSize`] when `batch_size` is zero.
    pub fn new(
        dispatcher: CollectorDispatcher,
        verifier: Verifier,
        batch_size: usize,
        cooldown: Duration,
    ) -> Result<Self, OrchestratorError> {
        if batch_size == 0 {
            return Err(OrchestratorError::InvalidBatchSize);
        }
        Ok(Self {
            dispatcher,
            verifier,
            batch_size,
            cooldown,
        })
    }

    /// Processes `queries` batch by batch. Every query inside a batch is
    /// dispatched concurrently and the batch waits for all of them; a
    /// cooldown separates consecutive batches.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidBatchSize`] only; per-query
    /// failures are counted, not returned.
    pub async fn run(
        &self,
        run_id: Uuid,
        queries: &[Query],
    ) -> Result<BatchSummary, OrchestratorError> {
        let batches = plan_batches(queries, self.batch_size)?;
        let total = batches.len();
        let mut summary = BatchSummary::default();

        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 && !self.cooldown.is_zero() {
                tokio::time::sleep(self.cooldown).await;
            }

            let outcomes =
                join_all(batch.iter().map(|q| self.dispatcher.dispatch(run_id, q))).await;

            let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
            let failed = outcomes.len() - succeeded;
            summary.succeeded += succeeded;
            summary.failed += failed;
            summary.batch_sizes.push(batch.len());

            let execution_ids: Vec<Uuid> =
                outcomes.iter().flat_map(QueryOutcome::execution_ids).collect();
            let corrected = self.verifier.reconcile_batch(&execution_ids).await;

            tracing::info!(
                run_id = %run_id,
                batch = index + 1,
                batches = total,
                size = batch.len(),
                succeeded,
                failed,
                corrected,
                "batch settled"
            );
        }

        Ok(summary)
    }
}
