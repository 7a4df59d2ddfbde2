use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreError;

/// One AI answer-engine integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CollectorType {
    #[serde(rename = "chatgpt")]
    ChatGpt,
    #[serde(rename = "perplexity")]
    Perplexity,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "copilot")]
    Copilot,
    #[serde(rename = "grok")]
    Grok,
    #[serde(rename = "google_ai_overview")]
    GoogleAiOverview,
    #[serde(rename = "google_ai_mode")]
    GoogleAiMode,
}

impl CollectorType {
    pub const ALL: [CollectorType; 8] = [
        CollectorType::ChatGpt,
        CollectorType::Perplexity,
        CollectorType::Gemini,
        CollectorType::Claude,
        CollectorType::Copilot,
        CollectorType::Grok,
        CollectorType::GoogleAiOverview,
        CollectorType::GoogleAiMode,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CollectorType::ChatGpt => "chatgpt",
            CollectorType::Perplexity => "perplexity",
            CollectorType::Gemini => "gemini",
            CollectorType::Claude => "claude",
            CollectorType::Copilot => "copilot",
            CollectorType::Grok => "grok",
            CollectorType::GoogleAiOverview => "google_ai_overview",
            CollectorType::GoogleAiMode => "google_ai_mode",
        }
    }
}

impl std::fmt::Display for CollectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectorType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectorType::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::UnknownCollector(s.to_string()))
    }
}

/// One question to be asked of the enabled answer engines.
///
/// Supplied by an external query source; never mutated by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    pub brand_id: Uuid,
    pub enabled_collectors: Vec<CollectorType>,
}

impl Query {
    /// Enabled collectors with duplicates removed, in first-seen order.
    #[must_use]
    pub fn distinct_collectors(&self) -> Vec<CollectorType> {
        let mut seen = Vec::with_capacity(self.enabled_collectors.len());
        for c in &self.enabled_collectors {
            if !seen.contains(c) {
                seen.push(*c);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_type_round_trips_through_str() {
        for c in CollectorType::ALL {
            assert_eq!(c.as_str().parse::<CollectorType>().unwrap(), c);
        }
    }

    #[test]
    fn collector_type_rejects_unknown() {
        let err = "altavista".parse::<CollectorType>().unwrap_err();
        assert!(err.to_string().contains("altavista"));
    }

    #[test]
    fn collector_type_serde_matches_as_str() {
        let json = serde_json::to_string(&CollectorType::GoogleAiOverview).unwrap();
        assert_eq!(json, "\"google_ai_overview\"");
    }

    #[test]
    fn distinct_collectors_drops_duplicates() {
        let q = Query {
            id: Uuid::new_v4(),
            text: "best hemp seltzer".to_string(),
            brand_id: Uuid::new_v4(),
            enabled_collectors: vec![
                CollectorType::Gemini,
                CollectorType::ChatGpt,
                CollectorType::Gemini,
            ],
        };
        assert_eq!(
            q.distinct_collectors(),
            vec![CollectorType::Gemini, CollectorType::ChatGpt]
        );
    }
}
