//! Read-only access to the external query source.

use aqo_core::{CollectorType, Query};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueryRow {
    pub id: Uuid,
    pub text: String,
    pub brand_id: Uuid,
    pub enabled_collectors: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl QueryRow {
    /// Converts to a [`Query`], dropping collector names this build does not know.
    #[must_use]
    pub fn into_query(self) -> Query {
        let enabled_collectors = self
            .enabled_collectors
            .iter()
            .filter_map(|name| name.parse::<CollectorType>().ok())
            .collect();

        Query {
            id: self.id,
            text: self.text,
            brand_id: self.brand_id,
            enabled_collectors,
        }
    }
}

/// Active queries, oldest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_active_queries(pool: &PgPool, limit: i64) -> Result<Vec<Query>, DbError> {
    let rows = sqlx::query_as::<_, QueryRow>(
        "SELECT id, text, brand_id, enabled_collectors, is_active, created_at \
         FROM queries \
         WHERE is_active = true \
         ORDER BY created_at ASC, id ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(QueryRow::into_query).collect())
}
