//! Database operations for `executions`.
//!
//! Every status mutation is a compare-and-swap on the expected current
//! status. Zero rows affected means another writer got there first; the
//! caller must re-read rather than retry blindly.

use aqo_core::{CollectorType, Execution, ExecutionError, ExecutionStatus};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbError;

/// A row from the `executions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub query_id: Uuid,
    pub collector_type: String,
    pub status: String,
    pub result_id: Option<Uuid>,
    pub error: Option<serde_json::Value>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = DbError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let collector_type = row
            .collector_type
            .parse::<CollectorType>()
            .map_err(|e| DbError::decode("collector_type", e))?;
        let status = row
            .status
            .parse::<ExecutionStatus>()
            .map_err(|e| DbError::decode("status", e))?;
        let error = row
            .error
            .map(serde_json::from_value::<ExecutionError>)
            .transpose()
            .map_err(|e| DbError::decode("error", e))?;

        Ok(Execution {
            id: row.id,
            run_id: row.run_id,
            query_id: row.query_id,
            collector_type,
            status,
            result_id: row.result_id,
            error,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, run_id, query_id, collector_type, status, result_id, \
     error, version, created_at, updated_at";

fn into_executions(rows: Vec<ExecutionRow>) -> Result<Vec<Execution>, DbError> {
    rows.into_iter().map(Execution::try_from).collect()
}

/// Ensures a `pending` execution exists for `(run_id, query_id, collector)`.
///
/// Idempotent: an existing row for the same key is returned unchanged.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert or fetch fails.
pub async fn create_execution(
    pool: &PgPool,
    run_id: Uuid,
    query_id: Uuid,
    collector: CollectorType,
) -> Result<Execution, DbError> {
    let inserted = sqlx::query_as::<_, ExecutionRow>(&format!(
        "INSERT INTO executions (id, run_id, query_id, collector_type, status) \
         VALUES ($1, $2, $3, $4, 'pending') \
         ON CONFLICT (run_id, query_id, collector_type) DO NOTHING \
         RETURNING {EXECUTION_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(run_id)
    .bind(query_id)
    .bind(collector.as_str())
    .fetch_optional(pool)
    .await?;

    let row = match inserted {
        Some(row) => row,
        None => {
            sqlx::query_as::<_, ExecutionRow>(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions \
                 WHERE run_id = $1 AND query_id = $2 AND collector_type = $3"
            ))
            .bind(run_id)
            .bind(query_id)
            .bind(collector.as_str())
            .fetch_one(pool)
            .await?
        }
    };

    Execution::try_from(row)
}

/// Fetches a single execution by id.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails or [`DbError::Decode`] if the
/// row holds an unknown status or collector.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<Execution>, DbError> {
    sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(Execution::try_from)
    .transpose()
}

/// Compare-and-swap status update.
///
/// Moves the execution from `expected` to `next` only if it is still in
/// `expected`. `result_id` is kept when `None` is passed; `error` always
/// replaces the stored error. Returns whether the swap happened.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn transition_execution(
    pool: &PgPool,
    id: Uuid,
    expected: ExecutionStatus,
    next: ExecutionStatus,
    result_id: Option<Uuid>,
    error: Option<&ExecutionError>,
) -> Result<bool, DbError> {
    let error_json = error
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| DbError::decode("error", e))?;

    let result = sqlx::query(
        "UPDATE executions \
         SET status = $3, \
             result_id = COALESCE($4, result_id), \
             error = $5, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(expected.as_str())
    .bind(next.as_str())
    .bind(result_id)
    .bind(error_json)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Executions in any of `statuses` whose last update is older than `updated_before`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_stale_executions(
    pool: &PgPool,
    statuses: &[ExecutionStatus],
    updated_before: DateTime<Utc>,
) -> Result<Vec<Execution>, DbError> {
    let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions \
         WHERE status = ANY($1) AND updated_at < $2 \
         ORDER BY updated_at ASC"
    ))
    .bind(&statuses)
    .bind(updated_before)
    .fetch_all(pool)
    .await?;

    into_executions(rows)
}

/// `failed` executions that nevertheless own a usable result.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_failed_with_results(pool: &PgPool) -> Result<Vec<Execution>, DbError> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        "SELECT e.id, e.run_id, e.query_id, e.collector_type, e.status, e.result_id, \
                e.error, e.version, e.created_at, e.updated_at \
         FROM executions e \
         JOIN results r ON r.execution_id = e.id \
         WHERE e.status = 'failed' AND r.failure IS NULL",
    )
    .fetch_all(pool)
    .await?;

    into_executions(rows)
}

/// All executions belonging to one collection run.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_run_executions(pool: &PgPool, run_id: Uuid) -> Result<Vec<Execution>, DbError> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions \
         WHERE run_id = $1 \
         ORDER BY created_at ASC"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    into_executions(rows)
}
