//! HTTP client for the consolidated analysis endpoint.
//!
//! One call returns entities, citation categories and per-entity sentiment
//! for a result, replacing one call per downstream analyzer.

use std::time::Duration;

use aqo_core::{CachedAnalysis, Citation, ResultRecord};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use uuid::Uuid;

use crate::backend::AnalysisBackend;
use crate::client::parse_endpoint;
use crate::error::ProviderError;
use crate::types::AnalysisBody;

const ANALYSIS_PROVIDER: &str = "analysis";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    result_id: Uuid,
    text: &'a str,
    citations: &'a [Citation],
    urls: &'a [String],
}

pub struct HttpAnalysisClient {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpAnalysisClient {
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidEndpoint`] if `endpoint` is not a valid URL.
    pub fn new(client: Client, endpoint: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            client,
            endpoint: parse_endpoint(endpoint)?,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisClient {
    async fn analyze(
        &self,
        result: &ResultRecord,
        api_key: &str,
    ) -> Result<CachedAnalysis, ProviderError> {
        let request = AnalysisRequest {
            result_id: result.id,
            text: &result.text,
            citations: &result.citations,
            urls: &result.urls,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                provider: ANALYSIS_PROVIDER.to_owned(),
                retry_after_secs: None,
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Server {
                provider: ANALYSIS_PROVIDER.to_owned(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                provider: ANALYSIS_PROVIDER.to_owned(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body = response.text().await?;
        let parsed: AnalysisBody =
            serde_json::from_str(&body).map_err(|e| ProviderError::Deserialize {
                context: format!("analysis of result {}", result.id),
                source: e,
            })?;

        Ok(CachedAnalysis {
            result_id: result.id,
            entities: parsed.entities,
            citation_categories: parsed.citation_categories,
            sentiment_by_entity: parsed.sentiment_by_entity,
            created_at: Utc::now(),
        })
    }
}
