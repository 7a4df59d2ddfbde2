//! JSON-over-HTTP provider backend.
//!
//! Submits with `POST <endpoint>` and a bearer key. The body is either an
//! answer (`{"text": .., "citations": [..], "urls": [..]}`), a deferred job
//! (`{"job_id": ..}`), or a captured failure (`{"error": ..}`). Deferred jobs
//! are checked with `GET <status_endpoint>/<job_id>`, the job id encoded as
//! a single path segment.

use std::time::Duration;

use aqo_core::{AnswerPayload, ProviderConfig};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};

use crate::backend::ProviderBackend;
use crate::error::ProviderError;
use crate::types::{AnswerRequest, JobHandle, JobStatus, JobStatusBody, Submission, SubmitEnvelope};

const MAX_ERROR_BODY_CHARS: usize = 200;

/// Builds the shared `reqwest` client used by every HTTP backend.
///
/// Per-request deadlines come from each provider's `timeout_ms`.
///
/// # Errors
///
/// Returns [`ProviderError::Http`] if the client cannot be constructed.
pub fn build_http_client(user_agent: &str) -> Result<Client, ProviderError> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(user_agent)
        .build()?)
}

/// A provider reachable over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    name: String,
    endpoint: Url,
    status_endpoint: Option<Url>,
    timeout: Duration,
}

impl HttpProvider {
    /// Creates a backend for `config` using a shared client.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidEndpoint`] if either endpoint is not a
    /// valid URL.
    pub fn new(client: Client, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let endpoint = parse_endpoint(&config.endpoint)?;
        let status_endpoint = config
            .status_endpoint
            .as_deref()
            .map(|raw| parse_endpoint(&format!("{}/", raw.trim_end_matches('/'))))
            .transpose()?;

        Ok(Self {
            client,
            name: config.name.clone(),
            endpoint,
            status_endpoint,
            timeout: config.timeout(),
        })
    }

    fn job_url(&self, job_id: &str) -> Result<Url, ProviderError> {
        let base = self
            .status_endpoint
            .as_ref()
            .ok_or_else(|| ProviderError::MissingStatusEndpoint(self.name.clone()))?;
        let invalid = |reason: &str| ProviderError::InvalidEndpoint {
            endpoint: format!("{base}{job_id}"),
            reason: reason.to_owned(),
        };
        // Dot segments would be dropped by the path builder and poll the base.
        if matches!(job_id, "" | "." | "..") {
            return Err(invalid("job id is not a usable path segment"));
        }

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|()| invalid("status endpoint cannot carry a path"))?
            .pop_if_empty()
            .push(job_id);
        Ok(url)
    }

    /// Maps non-2xx responses onto the error taxonomy and returns the body.
    async fn read_body(&self, response: Response) -> Result<String, ProviderError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            return Err(ProviderError::RateLimited {
                provider: self.name.clone(),
                retry_after_secs,
            });
        }

        if status.is_server_error() {
            return Err(ProviderError::Server {
                provider: self.name.clone(),
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                provider: self.name.clone(),
                status: status.as_u16(),
                message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        Ok(response.text().await?)
    }

    fn parse_submission(&self, body: &str) -> Result<Submission, ProviderError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| self.deserialize_error("submit", e))?;
        let envelope: SubmitEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| self.deserialize_error("submit", e))?;

        if let Some(job_id) = envelope.job_id {
            return Ok(Submission::Deferred(JobHandle {
                provider: self.name.clone(),
                job_id,
            }));
        }

        if let Some(message) = envelope.error {
            return Err(ProviderError::Captured {
                provider: self.name.clone(),
                message,
            });
        }

        let payload: AnswerPayload =
            serde_json::from_value(value).map_err(|e| self.deserialize_error("submit", e))?;
        Ok(Submission::Immediate(payload))
    }

    fn parse_job_status(&self, job: &JobHandle, body: &str) -> Result<JobStatus, ProviderError> {
        let parsed: JobStatusBody = serde_json::from_str(body)
            .map_err(|e| self.deserialize_error(&format!("job {}", job.job_id), e))?;

        let status = match parsed.status.to_ascii_lowercase().as_str() {
            "pending" | "queued" | "running" | "processing" => JobStatus::Pending,
            "done" | "completed" | "succeeded" | "ready" => match parsed.result {
                Some(payload) => JobStatus::Done(payload),
                None => JobStatus::Failed("job finished without a result".to_owned()),
            },
            "failed" | "error" | "cancelled" => JobStatus::Failed(
                parsed
                    .error
                    .unwrap_or_else(|| format!("job reported status '{}'", parsed.status)),
            ),
            other => {
                tracing::warn!(
                    provider = %self.name,
                    job_id = %job.job_id,
                    status = other,
                    "unrecognised job status; treating as pending"
                );
                JobStatus::Pending
            }
        };

        Ok(status)
    }

    fn deserialize_error(&self, what: &str, source: serde_json::Error) -> ProviderError {
        ProviderError::Deserialize {
            context: format!("{what} response from {}", self.name),
            source,
        }
    }
}

#[async_trait]
impl ProviderBackend for HttpProvider {
    async fn submit(
        &self,
        request: &AnswerRequest,
        api_key: &str,
    ) -> Result<Submission, ProviderError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        let body = self.read_body(response).await?;
        self.parse_submission(&body)
    }

    async fn check_job(
        &self,
        job: &JobHandle,
        api_key: &str,
    ) -> Result<JobStatus, ProviderError> {
        let url = self.job_url(&job.job_id)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .send()
            .await?;

        let body = self.read_body(response).await?;
        self.parse_job_status(job, &body)
    }
}

pub(crate) fn parse_endpoint(raw: &str) -> Result<Url, ProviderError> {
    Url::parse(raw).map_err(|e| ProviderError::InvalidEndpoint {
        endpoint: raw.to_owned(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
