//! Postgres-backed [`ExecutionStore`] and [`AnalysisStore`].

use aqo_core::{
    CachedAnalysis, CollectorType, Execution, ExecutionStatus, ResultRecord,
};
use aqo_db::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{
    all_failed_message, AnalysisStore, CollectionRun, ExecutionStore, RunStatus, TransitionPatch,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_usize(n: i32) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn run_status(raw: &str) -> Result<RunStatus, StoreError> {
    match raw {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "succeeded" => Ok(RunStatus::Succeeded),
        "failed" => Ok(RunStatus::Failed),
        other => Err(DbError::Decode {
            column: "collection_runs.status",
            reason: format!("unknown run status '{other}'"),
        }
        .into()),
    }
}

fn map_run_error(err: DbError) -> StoreError {
    match err {
        DbError::InvalidCollectionRunTransition {
            id,
            expected_status,
        } => StoreError::InvalidRunTransition {
            id,
            expected: expected_status,
        },
        other => StoreError::Db(other),
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        aqo_db::health_check(&self.pool).await?;
        Ok(())
    }

    async fn create_run(
        &self,
        run_id: Uuid,
        trigger_source: &str,
        query_count: usize,
    ) -> Result<(), StoreError> {
        aqo_db::create_collection_run(&self.pool, run_id, trigger_source, to_i32(query_count))
            .await?;
        Ok(())
    }

    async fn start_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        aqo_db::start_collection_run(&self.pool, run_id)
            .await
            .map_err(map_run_error)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        let outcome = if succeeded == 0 && failed > 0 {
            aqo_db::fail_collection_run(
                &self.pool,
                run_id,
                0,
                to_i32(failed),
                &all_failed_message(failed),
            )
            .await
        } else {
            aqo_db::complete_collection_run(&self.pool, run_id, to_i32(succeeded), to_i32(failed))
                .await
        };
        outcome.map_err(map_run_error)
    }

    async fn fail_run(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        aqo_db::fail_collection_run(&self.pool, run_id, 0, 0, message)
            .await
            .map_err(map_run_error)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, StoreError> {
        match aqo_db::get_collection_run(&self.pool, run_id).await {
            Ok(row) => Ok(Some(CollectionRun {
                id: row.id,
                status: run_status(&row.status)?,
                trigger_source: row.trigger_source,
                query_count: to_usize(row.query_count),
                succeeded_count: to_usize(row.succeeded_count),
                failed_count: to_usize(row.failed_count),
                error_message: row.error_message,
            })),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_execution(
        &self,
        run_id: Uuid,
        query_id: Uuid,
        collector: CollectorType,
    ) -> Result<Execution, StoreError> {
        Ok(aqo_db::create_execution(&self.pool, run_id, query_id, collector).await?)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(aqo_db::get_execution(&self.pool, id).await?)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        patch: TransitionPatch,
    ) -> Result<bool, StoreError> {
        Ok(aqo_db::transition_execution(
            &self.pool,
            id,
            expected,
            next,
            patch.result_id,
            patch.error.as_ref(),
        )
        .await?)
    }

    async fn insert_result(&self, record: &ResultRecord) -> Result<ResultRecord, StoreError> {
        Ok(aqo_db::insert_result_if_absent(&self.pool, record).await?)
    }

    async fn find_result(&self, execution_id: Uuid) -> Result<Option<ResultRecord>, StoreError> {
        Ok(aqo_db::get_result_for_execution(&self.pool, execution_id).await?)
    }

    async fn get_result(&self, result_id: Uuid) -> Result<Option<ResultRecord>, StoreError> {
        Ok(aqo_db::get_result(&self.pool, result_id).await?)
    }

    async fn list_stale(
        &self,
        statuses: &[ExecutionStatus],
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        Ok(aqo_db::list_stale_executions(&self.pool, statuses, updated_before).await?)
    }

    async fn list_failed_with_results(&self) -> Result<Vec<Execution>, StoreError> {
        Ok(aqo_db::list_failed_with_results(&self.pool).await?)
    }
}

#[async_trait]
impl AnalysisStore for PgStore {
    async fn get_analysis(&self, result_id: Uuid) -> Result<Option<CachedAnalysis>, StoreError> {
        Ok(aqo_db::get_cached_analysis(&self.pool, result_id).await?)
    }

    async fn insert_analysis_if_absent(
        &self,
        analysis: &CachedAnalysis,
    ) -> Result<CachedAnalysis, StoreError> {
        Ok(aqo_db::insert_cached_analysis_if_absent(&self.pool, analysis).await?)
    }
}
