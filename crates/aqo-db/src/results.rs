//! Database operations for `results`.

use aqo_core::{Citation, ResultRecord};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResultRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub text: String,
    pub citations: serde_json::Value,
    pub urls: serde_json::Value,
    pub metadata: serde_json::Value,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for ResultRecord {
    type Error = DbError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let citations: Vec<Citation> =
            serde_json::from_value(row.citations).map_err(|e| DbError::decode("citations", e))?;
        let urls: Vec<String> =
            serde_json::from_value(row.urls).map_err(|e| DbError::decode("urls", e))?;

        Ok(ResultRecord {
            id: row.id,
            execution_id: row.execution_id,
            text: row.text,
            citations,
            urls,
            metadata: row.metadata,
            failure: row.failure,
            created_at: row.created_at,
        })
    }
}

const RESULT_COLUMNS: &str =
    "id, execution_id, text, citations, urls, metadata, failure, created_at";

/// Inserts `record` unless its execution already has a result.
///
/// Returns whichever row is stored afterwards, so concurrent writers for the
/// same execution all observe the single winner.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert or fetch fails.
pub async fn insert_result_if_absent(
    pool: &PgPool,
    record: &ResultRecord,
) -> Result<ResultRecord, DbError> {
    let citations =
        serde_json::to_value(&record.citations).map_err(|e| DbError::decode("citations", e))?;
    let urls = serde_json::to_value(&record.urls).map_err(|e| DbError::decode("urls", e))?;

    let inserted = sqlx::query_as::<_, ResultRow>(&format!(
        "INSERT INTO results (id, execution_id, text, citations, urls, metadata, failure) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (execution_id) DO NOTHING \
         RETURNING {RESULT_COLUMNS}"
    ))
    .bind(record.id)
    .bind(record.execution_id)
    .bind(&record.text)
    .bind(citations)
    .bind(urls)
    .bind(&record.metadata)
    .bind(record.failure.as_deref())
    .fetch_optional(pool)
    .await?;

    match inserted {
        Some(row) => ResultRecord::try_from(row),
        None => get_result_for_execution(pool, record.execution_id)
            .await?
            .ok_or(DbError::NotFound),
    }
}

/// Fetches the result owned by `execution_id`, if any.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_result_for_execution(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Option<ResultRecord>, DbError> {
    sqlx::query_as::<_, ResultRow>(&format!(
        "SELECT {RESULT_COLUMNS} FROM results WHERE execution_id = $1"
    ))
    .bind(execution_id)
    .fetch_optional(pool)
    .await?
    .map(ResultRecord::try_from)
    .transpose()
}

/// Fetches a result by its own id.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_result(pool: &PgPool, id: Uuid) -> Result<Option<ResultRecord>, DbError> {
    sqlx::query_as::<_, ResultRow>(&format!(
        "SELECT {RESULT_COLUMNS} FROM results WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(ResultRecord::try_from)
    .transpose()
}
