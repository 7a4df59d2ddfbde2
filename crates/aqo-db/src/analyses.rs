//! Database operations for `cached_analyses`.
//!
//! Keyed by result id. The first insert wins; later inserts for the same
//! result read back the stored row instead.

use aqo_core::CachedAnalysis;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
struct CachedAnalysisRow {
    result_id: Uuid,
    entities: serde_json::Value,
    citation_categories: serde_json::Value,
    sentiment_by_entity: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<CachedAnalysisRow> for CachedAnalysis {
    type Error = DbError;

    fn try_from(row: CachedAnalysisRow) -> Result<Self, Self::Error> {
        Ok(CachedAnalysis {
            result_id: row.result_id,
            entities: serde_json::from_value(row.entities)
                .map_err(|e| DbError::decode("entities", e))?,
            citation_categories: serde_json::from_value(row.citation_categories)
                .map_err(|e| DbError::decode("citation_categories", e))?,
            sentiment_by_entity: serde_json::from_value(row.sentiment_by_entity)
                .map_err(|e| DbError::decode("sentiment_by_entity", e))?,
            created_at: row.created_at,
        })
    }
}

const ANALYSIS_COLUMNS: &str =
    "result_id, entities, citation_categories, sentiment_by_entity, created_at";

/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_cached_analysis(
    pool: &PgPool,
    result_id: Uuid,
) -> Result<Option<CachedAnalysis>, DbError> {
    sqlx::query_as::<_, CachedAnalysisRow>(&format!(
        "SELECT {ANALYSIS_COLUMNS} FROM cached_analyses WHERE result_id = $1"
    ))
    .bind(result_id)
    .fetch_optional(pool)
    .await?
    .map(CachedAnalysis::try_from)
    .transpose()
}

/// Stores `analysis` unless one already exists; returns the stored row.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert or fetch fails.
pub async fn insert_cached_analysis_if_absent(
    pool: &PgPool,
    analysis: &CachedAnalysis,
) -> Result<CachedAnalysis, DbError> {
    let entities =
        serde_json::to_value(&analysis.entities).map_err(|e| DbError::decode("entities", e))?;
    let categories = serde_json::to_value(&analysis.citation_categories)
        .map_err(|e| DbError::decode("citation_categories", e))?;
    let sentiment = serde_json::to_value(&analysis.sentiment_by_entity)
        .map_err(|e| DbError::decode("sentiment_by_entity", e))?;

    let inserted = sqlx::query_as::<_, CachedAnalysisRow>(&format!(
        "INSERT INTO cached_analyses \
             (result_id, entities, citation_categories, sentiment_by_entity) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (result_id) DO NOTHING \
         RETURNING {ANALYSIS_COLUMNS}"
    ))
    .bind(analysis.result_id)
    .bind(entities)
    .bind(categories)
    .bind(sentiment)
    .fetch_optional(pool)
    .await?;

    match inserted {
        Some(row) => CachedAnalysis::try_from(row),
        None => get_cached_analysis(pool, analysis.result_id)
            .await?
            .ok_or(DbError::NotFound),
    }
}
