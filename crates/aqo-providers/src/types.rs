//! Wire-neutral request and response shapes shared by every backend.

use aqo_core::{AnswerPayload, CollectorType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The opaque request a provider receives for one (query, collector) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerRequest {
    pub execution_id: Uuid,
    pub query_id: Uuid,
    pub brand_id: Uuid,
    pub collector: CollectorType,
    pub query: String,
}

/// Reference to a deferred job, polled later for completion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub provider: String,
    pub job_id: String,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Sync providers answer in the response.
    Immediate(AnswerPayload),
    /// Async providers hand back a job to poll.
    Deferred(JobHandle),
}

/// State of a deferred job at one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Done(AnswerPayload),
    Failed(String),
}

/// Envelope fields of a submit response. Anything else is the answer itself.
#[derive(Debug, Deserialize)]
pub(crate) struct SubmitEnvelope {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Raw body of a job-status response.
#[derive(Debug, Deserialize)]
pub(crate) struct JobStatusBody {
    pub status: String,
    #[serde(default)]
    pub result: Option<AnswerPayload>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Raw body returned by the consolidated analysis endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct AnalysisBody {
    #[serde(default)]
    pub entities: Vec<aqo_core::EntityMention>,
    #[serde(default)]
    pub citation_categories: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub sentiment_by_entity: std::collections::BTreeMap<String, aqo_core::Sentiment>,
}
