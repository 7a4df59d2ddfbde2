//! Provider backends for the answer query orchestrator.

pub mod analysis;
pub mod backend;
pub mod client;
pub mod error;
pub mod registry;
pub mod types;

pub use analysis::HttpAnalysisClient;
pub use backend::{AnalysisBackend, ProviderBackend};
pub use client::{build_http_client, HttpProvider};
pub use error::ProviderError;
pub use registry::BackendRegistry;
pub use types::{AnswerRequest, JobHandle, JobStatus, Submission};
