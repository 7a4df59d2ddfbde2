//! Pluggable provider and analysis backends.
//!
//! The orchestrator only talks to these traits. [`crate::HttpProvider`] and
//! [`crate::HttpAnalysisClient`] are the production implementations; tests
//! substitute scripted doubles.

use aqo_core::{CachedAnalysis, ResultRecord};
use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::{AnswerRequest, JobHandle, JobStatus, Submission};

/// One concrete backend able to serve a collector.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Sends the request. Sync providers answer immediately; async providers
    /// return a [`JobHandle`] to poll.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport failures, non-2xx responses, or
    /// a response body that reports a failure.
    async fn submit(
        &self,
        request: &AnswerRequest,
        api_key: &str,
    ) -> Result<Submission, ProviderError>;

    /// Checks the state of a deferred job.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the status call itself fails. A job that
    /// finished unsuccessfully is `Ok(JobStatus::Failed(..))`.
    async fn check_job(&self, job: &JobHandle, api_key: &str)
        -> Result<JobStatus, ProviderError>;
}

/// The consolidated downstream analysis call behind the result cache.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Computes entities, citation categories and sentiment for one result in
    /// a single call.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the call fails or the body cannot be parsed.
    async fn analyze(
        &self,
        result: &ResultRecord,
        api_key: &str,
    ) -> Result<CachedAnalysis, ProviderError>;
}
