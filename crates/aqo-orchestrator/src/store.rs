//! Persistence seam for executions, results, runs and cached analyses.
//!
//! Every status mutation goes through [`ExecutionStore::transition`], a
//! compare-and-swap on the expected current status. `false` means another
//! writer moved the row first; callers re-read instead of overwriting.
//!
//! [`MemoryStore`] backs tests and dry runs; [`crate::PgStore`] is the
//! Postgres implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use aqo_core::{
    CachedAnalysis, CollectorType, Execution, ExecutionError, ExecutionStatus, ResultRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

/// Optional fields written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPatch {
    /// Kept as-is when `None`.
    pub result_id: Option<Uuid>,
    /// Always replaces the stored error.
    pub error: Option<ExecutionError>,
}

impl TransitionPatch {
    #[must_use]
    pub fn result(result_id: Uuid) -> Self {
        Self {
            result_id: Some(result_id),
            error: None,
        }
    }

    #[must_use]
    pub fn error(error: ExecutionError) -> Self {
        Self {
            result_id: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// One `submit_batch` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRun {
    pub id: Uuid,
    pub trigger_source: String,
    pub status: RunStatus,
    pub query_count: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Cheap liveness probe run before each batch set.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_run(
        &self,
        run_id: Uuid,
        trigger_source: &str,
        query_count: usize,
    ) -> Result<(), StoreError>;

    /// `queued -> running`.
    async fn start_run(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// `running -> succeeded`, or `running -> failed` when queries were
    /// submitted and none succeeded.
    async fn finish_run(
        &self,
        run_id: Uuid,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError>;

    /// `running -> failed` for runs aborted by an infrastructure error.
    async fn fail_run(&self, run_id: Uuid, message: &str) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, StoreError>;

    /// Returns the execution for `(run_id, query_id, collector)`, creating it
    /// `pending` if absent.
    async fn ensure_execution(
        &self,
        run_id: Uuid,
        query_id: Uuid,
        collector: CollectorType,
    ) -> Result<Execution, StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Compare-and-swap status update. Returns whether the swap happened.
    async fn transition(
        &self,
        id: Uuid,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        patch: TransitionPatch,
    ) -> Result<bool, StoreError>;

    /// Stores `record` unless its execution already has a result; returns the
    /// stored winner either way.
    async fn insert_result(&self, record: &ResultRecord) -> Result<ResultRecord, StoreError>;

    async fn find_result(&self, execution_id: Uuid) -> Result<Option<ResultRecord>, StoreError>;

    async fn get_result(&self, result_id: Uuid) -> Result<Option<ResultRecord>, StoreError>;

    /// Executions in any of `statuses` not updated since `updated_before`.
    async fn list_stale(
        &self,
        statuses: &[ExecutionStatus],
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError>;

    /// `failed` executions that own a usable result.
    async fn list_failed_with_results(&self) -> Result<Vec<Execution>, StoreError>;
}

/// Storage for the consolidated analysis cache.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn get_analysis(&self, result_id: Uuid) -> Result<Option<CachedAnalysis>, StoreError>;

    /// First writer wins; returns the stored row.
    async fn insert_analysis_if_absent(
        &self,
        analysis: &CachedAnalysis,
    ) -> Result<CachedAnalysis, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<Uuid, CollectionRun>,
    executions: HashMap<Uuid, Execution>,
    by_key: HashMap<(Uuid, Uuid, CollectorType), Uuid>,
    results: HashMap<Uuid, ResultRecord>,
    analyses: HashMap<Uuid, CachedAnalysis>,
}

/// In-process store with the same compare-and-swap semantics as Postgres.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// All executions, oldest first.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self.lock().executions.values().cloned().collect();
        all.sort_by_key(|e| (e.created_at, e.id));
        all
    }

    #[must_use]
    pub fn results(&self) -> Vec<ResultRecord> {
        self.lock().results.values().cloned().collect()
    }

    #[must_use]
    pub fn analysis_count(&self) -> usize {
        self.lock().analyses.len()
    }

    /// Overwrites `updated_at`, for simulating rows left behind by a crash.
    pub fn set_updated_at(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(exec) = self.lock().executions.get_mut(&id) {
            exec.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_run(
        &self,
        run_id: Uuid,
        trigger_source: &str,
        query_count: usize,
    ) -> Result<(), StoreError> {
        self.lock().runs.insert(
            run_id,
            CollectionRun {
                id: run_id,
                trigger_source: trigger_source.to_owned(),
                status: RunStatus::Queued,
                query_count,
                succeeded_count: 0,
                failed_count: 0,
                error_message: None,
            },
        );
        Ok(())
    }

    async fn start_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status != RunStatus::Queued {
            return Err(StoreError::InvalidRunTransition {
                id: run_id,
                expected: RunStatus::Queued.as_str(),
            });
        }
        run.status = RunStatus::Running;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::InvalidRunTransition {
                id: run_id,
                expected: RunStatus::Running.as_str(),
            });
        }
        run.succeeded_count = succeeded;
        run.failed_count = failed;
        if succeeded == 0 && failed > 0 {
            run.status = RunStatus::Failed;
            run.error_message = Some(all_failed_message(failed));
        } else {
            run.status = RunStatus::Succeeded;
        }
        Ok(())
    }

    async fn fail_run(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::InvalidRunTransition {
                id: run_id,
                expected: RunStatus::Running.as_str(),
            });
        }
        run.status = RunStatus::Failed;
        run.error_message = Some(message.to_owned());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, StoreError> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn ensure_execution(
        &self,
        run_id: Uuid,
        query_id: Uuid,
        collector: CollectorType,
    ) -> Result<Execution, StoreError> {
        let mut state = self.lock();
        let key = (run_id, query_id, collector);
        if let Some(existing) = state.by_key.get(&key).and_then(|id| state.executions.get(id)) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let exec = Execution {
            id: Uuid::new_v4(),
            run_id,
            query_id,
            collector_type: collector,
            status: ExecutionStatus::Pending,
            result_id: None,
            error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        state.by_key.insert(key, exec.id);
        state.executions.insert(exec.id, exec.clone());
        Ok(exec)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.lock().executions.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        patch: TransitionPatch,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(exec) = state.executions.get_mut(&id) else {
            return Ok(false);
        };
        if exec.status != expected {
            return Ok(false);
        }

        exec.status = next;
        if patch.result_id.is_some() {
            exec.result_id = patch.result_id;
        }
        exec.error = patch.error;
        exec.version += 1;
        exec.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_result(&self, record: &ResultRecord) -> Result<ResultRecord, StoreError> {
        let mut state = self.lock();
        if !state.executions.contains_key(&record.execution_id) {
            return Err(StoreError::ExecutionNotFound(record.execution_id));
        }
        Ok(state
            .results
            .entry(record.execution_id)
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn find_result(&self, execution_id: Uuid) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self.lock().results.get(&execution_id).cloned())
    }

    async fn get_result(&self, result_id: Uuid) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self
            .lock()
            .results
            .values()
            .find(|r| r.id == result_id)
            .cloned())
    }

    async fn list_stale(
        &self,
        statuses: &[ExecutionStatus],
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut stale: Vec<Execution> = self
            .lock()
            .executions
            .values()
            .filter(|e| statuses.contains(&e.status) && e.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|e| e.updated_at);
        Ok(stale)
    }

    async fn list_failed_with_results(&self) -> Result<Vec<Execution>, StoreError> {
        let state = self.lock();
        Ok(state
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .filter(|e| state.results.get(&e.id).is_some_and(ResultRecord::is_usable))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn get_analysis(&self, result_id: Uuid) -> Result<Option<CachedAnalysis>, StoreError> {
        Ok(self.lock().analyses.get(&result_id).cloned())
    }

    async fn insert_analysis_if_absent(
        &self,
        analysis: &CachedAnalysis,
    ) -> Result<CachedAnalysis, StoreError> {
        Ok(self
            .lock()
            .analyses
            .entry(analysis.result_id)
            .or_insert_with(|| analysis.clone())
            .clone())
    }
}

pub(crate) fn all_failed_message(failed: usize) -> String {
    format!("all {failed} queries failed")
}
