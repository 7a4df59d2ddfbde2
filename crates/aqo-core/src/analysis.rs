use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMention {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub mentions: u32,
}

/// Consolidated downstream analysis for one result, computed at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnalysis {
    pub result_id: Uuid,
    #[serde(default)]
    pub entities: Vec<EntityMention>,
    /// Citation URL to category label.
    #[serde(default)]
    pub citation_categories: BTreeMap<String, String>,
    /// Entity name to sentiment label.
    #[serde(default)]
    pub sentiment_by_entity: BTreeMap<String, Sentiment>,
    pub created_at: DateTime<Utc>,
}
