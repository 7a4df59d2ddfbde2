use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Answer returned by a provider, before it is persisted.
///
/// `failure` is set when the provider answered but the answer itself records
/// a failure (for example an async job that finished with an error body).
/// Such payloads never complete an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnswerPayload {
    pub text: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub failure: Option<String>,
}

impl AnswerPayload {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// A persisted answer, 1:1 with its execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub text: String,
    pub citations: Vec<Citation>,
    pub urls: Vec<String>,
    pub metadata: serde_json::Value,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    #[must_use]
    pub fn from_payload(execution_id: Uuid, payload: &AnswerPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            text: payload.text.clone(),
            citations: payload.citations.clone(),
            urls: payload.urls.clone(),
            metadata: payload.metadata.clone(),
            failure: payload.failure.clone(),
            created_at: Utc::now(),
        }
    }

    /// A result counts toward completion only if it carries no failure marker.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.failure.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_deserializes_with_missing_optional_fields() {
        let payload: AnswerPayload = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert_eq!(payload.text, "hello");
        assert!(payload.citations.is_empty());
        assert!(payload.urls.is_empty());
        assert!(payload.failure.is_none());
    }

    #[test]
    fn failure_marker_makes_result_unusable() {
        let mut payload = AnswerPayload::text("partial");
        payload.failure = Some("upstream crashed".to_string());
        let record = ResultRecord::from_payload(Uuid::new_v4(), &payload);
        assert!(!record.is_usable());
    }
}
