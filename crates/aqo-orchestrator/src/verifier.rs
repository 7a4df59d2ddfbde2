//! Self-healing reconciliation of execution status against stored results.
//!
//! Three writers (dispatcher, poller, sweep) touch the same rows, and a crash
//! can land between a result write and the status write that should follow
//! it. The verifier repairs those gaps at three points:
//!
//! - right after a result write ([`Verifier::verify_execution`]);
//! - after every batch settles ([`Verifier::reconcile_batch`]);
//! - on a timer ([`Verifier::sweep`]), which also fails executions that
//!   have been stuck without a result for longer than the fail bound.
//!
//! The invariant being enforced: an execution is `completed` exactly when
//! it owns a usable result. A result carrying a failure marker means
//! `failed` with a `captured_failure` reason.
//!
//! Every correction is a compare-and-swap from the status just observed, so
//! a fresher write made concurrently is never overwritten. Executions that a
//! poller is still watching are never timed out by the sweep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aqo_core::{ErrorClass, Execution, ExecutionError, ExecutionStatus, ResultRecord};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{ExecutionStore, TransitionPatch};

const MAX_FORCE_ATTEMPTS: usize = 3;

/// Tallies from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale and failed-with-result executions inspected.
    pub examined: usize,
    /// Stale executions forced to `completed` because a result existed.
    pub completed: usize,
    /// Executions forced to `failed`.
    pub failed: usize,
    /// `failed` executions moved back to `completed`.
    pub healed: usize,
}

impl SweepReport {
    #[must_use]
    pub fn corrections(&self) -> usize {
        self.completed + self.failed + self.healed
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Correction {
    to: ExecutionStatus,
    patch: TransitionPatch,
}

fn correction_for(exec: &Execution, result: Option<&ResultRecord>) -> Option<Correction> {
    match result {
        Some(r) if r.is_usable() => {
            let settled = exec.status == ExecutionStatus::Completed && exec.result_id == Some(r.id);
            (!settled).then(|| Correction {
                to: ExecutionStatus::Completed,
                patch: TransitionPatch::result(r.id),
            })
        }
        Some(r) => (exec.status != ExecutionStatus::Failed).then(|| Correction {
            to: ExecutionStatus::Failed,
            patch: TransitionPatch::error(ExecutionError::new(
                None,
                ErrorClass::CapturedFailure,
                r.failure.clone().unwrap_or_default(),
            )),
        }),
        None if exec.status == ExecutionStatus::Completed => Some(Correction {
            to: ExecutionStatus::Failed,
            patch: TransitionPatch::error(ExecutionError::new(
                None,
                ErrorClass::PersistenceFailure,
                "completed without a stored result",
            )),
        }),
        None => None,
    }
}

/// Executions currently owned by an in-process poller task.
#[derive(Debug, Clone, Default)]
pub struct WatchedExecutions {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl WatchedExecutions {
    /// Returns `false` if `id` was already watched.
    pub fn insert(&self, id: Uuid) -> bool {
        self.lock().insert(id)
    }

    pub fn remove(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().contains(&id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn ExecutionStore>,
    stale_after: Duration,
    fail_after: Duration,
    watched: WatchedExecutions,
}

impl Verifier {
    /// `stale_after` selects sweep candidates; `fail_after` is how long a
    /// candidate may go without a result before it is failed. `fail_after`
    /// is raised to `stale_after` if smaller.
    #[must_use]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        stale_after: Duration,
        fail_after: Duration,
    ) -> Self {
        Self {
            store,
            stale_after,
            fail_after: fail_after.max(stale_after),
            watched: WatchedExecutions::default(),
        }
    }

    /// Registry shared with the poller; the sweep leaves these alone.
    #[must_use]
    pub fn watched(&self) -> &WatchedExecutions {
        &self.watched
    }

    /// Re-reads one execution and its result and forces the status they
    /// imply. Returns whether a correction was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn verify_execution(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        let Some(exec) = self.store.get_execution(execution_id).await? else {
            return Ok(false);
        };
        let result = self.store.find_result(execution_id).await?;
        match correction_for(&exec, result.as_ref()) {
            Some(correction) => self.force(&exec, correction, "verify").await,
            None => Ok(false),
        }
    }

    /// Verifies every execution created by one batch. Store errors are
    /// logged and skipped; the sweep picks those rows up later.
    pub async fn reconcile_batch(&self, execution_ids: &[Uuid]) -> usize {
        let mut corrected = 0;
        for id in execution_ids {
            match self.verify_execution(*id).await {
                Ok(true) => corrected += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(execution_id = %id, error = %e, "batch verification failed");
                }
            }
        }
        if corrected > 0 {
            tracing::info!(
                checked = execution_ids.len(),
                corrected,
                "batch verification corrected executions"
            );
        }
        corrected
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the stale listing cannot be read.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// One sweep pass evaluated as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the stale listing cannot be read.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let stale_before = cutoff(now, self.stale_after);
        let fail_before = cutoff(now, self.fail_after);
        let mut report = SweepReport::default();

        let stale = self
            .store
            .list_stale(
                &[ExecutionStatus::Running, ExecutionStatus::Pending],
                stale_before,
            )
            .await?;

        for exec in stale {
            report.examined += 1;
            let result = match self.store.find_result(exec.id).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %exec.id,
                        error = %e,
                        "sweep could not read result"
                    );
                    continue;
                }
            };

            let correction = correction_for(&exec, result.as_ref()).or_else(|| {
                let timed_out = result.is_none() && exec.updated_at <= fail_before;
                if timed_out && self.watched.contains(exec.id) {
                    tracing::debug!(
                        execution_id = %exec.id,
                        "stale execution still watched by a poller; not timing out"
                    );
                    return None;
                }
                timed_out.then(|| Correction {
                    to: ExecutionStatus::Failed,
                    patch: TransitionPatch::error(ExecutionError::timed_out_no_result()),
                })
            });
            let Some(correction) = correction else {
                continue;
            };

            let to = correction.to;
            match self.force(&exec, correction, "sweep").await {
                Ok(true) if to == ExecutionStatus::Completed => report.completed += 1,
                Ok(true) => report.failed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(execution_id = %exec.id, error = %e, "sweep correction failed");
                }
            }
        }

        for exec in self.store.list_failed_with_results().await? {
            report.examined += 1;
            match self.verify_execution(exec.id).await {
                Ok(true) => report.healed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(execution_id = %exec.id, error = %e, "sweep heal failed");
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            completed = report.completed,
            failed = report.failed,
            healed = report.healed,
            "sweep finished"
        );
        Ok(report)
    }

    /// CAS from the observed status to `correction.to`, re-reading and
    /// retrying a bounded number of times if another writer moved the row.
    async fn force(
        &self,
        observed: &Execution,
        correction: Correction,
        source: &'static str,
    ) -> Result<bool, StoreError> {
        let mut current = observed.clone();
        for _ in 0..MAX_FORCE_ATTEMPTS {
            if current.status == correction.to
                && (correction.patch.result_id.is_none()
                    || current.result_id == correction.patch.result_id)
            {
                return Ok(false);
            }

            let swapped = self
                .store
                .transition(
                    current.id,
                    current.status,
                    correction.to,
                    correction.patch.clone(),
                )
                .await?;
            if swapped {
                tracing::warn!(
                    execution_id = %current.id,
                    from = %current.status,
                    to = %correction.to,
                    source,
                    "forced execution status"
                );
                return Ok(true);
            }

            let Some(fresh) = self.store.get_execution(current.id).await? else {
                return Ok(false);
            };
            let result = self.store.find_result(current.id).await?;
            match correction_for(&fresh, result.as_ref()) {
                Some(next) if next == correction => current = fresh,
                _ => return Ok(false),
            }
        }
        tracing::warn!(
            execution_id = %observed.id,
            to = %correction.to,
            source,
            "gave up forcing execution status after repeated races"
        );
        Ok(false)
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
#[path = "verifier_test.rs"]
mod tests;
