//! Priority-ordered provider fallback for one collector.
//!
//! Providers are attempted strictly one at a time in ascending priority.
//! Each provider gets `retry_count + 1` attempts under its own timeout, each
//! with a freshly acquired key. On exhaustion the chain advances only if the
//! failed provider has `fallback_on_failure` set.

use std::sync::Arc;

use aqo_core::{AnswerPayload, ErrorClass, ExecutionError, ProviderConfig};
use aqo_providers::{
    AnswerRequest, BackendRegistry, JobHandle, ProviderBackend, ProviderError, Submission,
};
use thiserror::Error;

use crate::error::KeyPoolError;
use crate::key_pool::{KeyLease, KeyPool};
use crate::retry::{retry_with_backoff, Retriable};

/// Result of running one collector's chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// A sync provider answered.
    Answered {
        provider: String,
        payload: AnswerPayload,
    },
    /// An async provider accepted the job; the poller owns it from here.
    Deferred {
        provider: ProviderConfig,
        job: JobHandle,
    },
    /// Every eligible provider failed, or fallback was disabled.
    Exhausted(ExecutionError),
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Key(#[from] KeyPoolError),
    #[error("no backend registered for provider '{0}'")]
    NoBackend(String),
}

impl Retriable for AttemptError {
    fn is_retriable(&self) -> bool {
        match self {
            AttemptError::Provider(e) => e.is_retriable(),
            AttemptError::Key(_) | AttemptError::NoBackend(_) => false,
        }
    }
}

impl AttemptError {
    fn into_execution_error(self, provider: &str) -> ExecutionError {
        let class = match &self {
            AttemptError::Provider(e) => e.class(),
            AttemptError::Key(_) => ErrorClass::ProviderHardError,
            AttemptError::NoBackend(_) => ErrorClass::ProviderUnavailable,
        };
        ExecutionError::new(Some(provider), class, self.to_string())
    }
}

/// Feeds a provider failure back into the key's health.
pub(crate) fn report_failure(keys: &KeyPool, lease: &KeyLease, err: &ProviderError) {
    match err {
        ProviderError::RateLimited { .. } => keys.report_rate_limited(
            lease,
            err.retry_after_secs().map(std::time::Duration::from_secs),
        ),
        ProviderError::Rejected { .. } => keys.report_hard_error(lease, err.is_credential_error()),
        _ => keys.report_transient_error(lease),
    }
}

#[derive(Clone)]
pub struct ProviderChain {
    keys: Arc<KeyPool>,
    backends: Arc<BackendRegistry>,
}

impl ProviderChain {
    #[must_use]
    pub fn new(keys: Arc<KeyPool>, backends: Arc<BackendRegistry>) -> Self {
        Self { keys, backends }
    }

    /// Walks `providers` (already sorted by priority) until one succeeds.
    pub async fn run(&self, request: &AnswerRequest, providers: &[ProviderConfig]) -> ChainOutcome {
        let mut last_error = ExecutionError::new(
            None,
            ErrorClass::NoProviders,
            format!("no enabled providers for collector {}", request.collector),
        );

        for provider in providers {
            match self.attempt_provider(request, provider).await {
                Ok(Submission::Immediate(payload)) => {
                    tracing::info!(
                        execution_id = %request.execution_id,
                        collector = %request.collector,
                        provider = %provider.name,
                        "provider answered"
                    );
                    return ChainOutcome::Answered {
                        provider: provider.name.clone(),
                        payload,
                    };
                }
                Ok(Submission::Deferred(job)) => {
                    tracing::info!(
                        execution_id = %request.execution_id,
                        collector = %request.collector,
                        provider = %provider.name,
                        job_id = %job.job_id,
                        "provider deferred job"
                    );
                    return ChainOutcome::Deferred {
                        provider: provider.clone(),
                        job,
                    };
                }
                Err(err) => {
                    last_error = err.into_execution_error(&provider.name);
                    if !provider.fallback_on_failure {
                        tracing::warn!(
                            execution_id = %request.execution_id,
                            collector = %request.collector,
                            provider = %provider.name,
                            error = %last_error,
                            "provider failed and fallback is disabled; stopping chain"
                        );
                        return ChainOutcome::Exhausted(last_error);
                    }
                    tracing::warn!(
                        execution_id = %request.execution_id,
                        collector = %request.collector,
                        provider = %provider.name,
                        error = %last_error,
                        "provider failed; falling back"
                    );
                }
            }
        }

        ChainOutcome::Exhausted(last_error)
    }

    async fn attempt_provider(
        &self,
        request: &AnswerRequest,
        provider: &ProviderConfig,
    ) -> Result<Submission, AttemptError> {
        let backend = self
            .backends
            .get(&provider.name)
            .ok_or_else(|| AttemptError::NoBackend(provider.name.clone()))?;

        retry_with_backoff(provider.retry_count, provider.retry_backoff_ms, |attempt| {
            let backend = Arc::clone(&backend);
            async move { self.attempt_once(backend.as_ref(), request, provider, attempt).await }
        })
        .await
    }

    async fn attempt_once(
        &self,
        backend: &dyn ProviderBackend,
        request: &AnswerRequest,
        provider: &ProviderConfig,
        attempt: u32,
    ) -> Result<Submission, AttemptError> {
        let lease = self.keys.acquire(&provider.service)?;
        tracing::debug!(
            execution_id = %request.execution_id,
            provider = %provider.name,
            attempt,
            operation = lease.operation(),
            key = %lease.fingerprint(),
            "provider attempt"
        );

        let outcome = tokio::time::timeout(
            provider.timeout(),
            backend.submit(request, lease.secret()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ProviderError::Timeout {
                provider: provider.name.clone(),
                timeout_ms: provider.timeout_ms,
            })
        });

        // An answer that itself records a failure never completes an execution.
        let outcome = match outcome {
            Ok(Submission::Immediate(payload)) if payload.failure.is_some() => {
                Err(ProviderError::Captured {
                    provider: provider.name.clone(),
                    message: payload.failure.unwrap_or_default(),
                })
            }
            other => other,
        };

        match outcome {
            Ok(submission) => {
                self.keys.report_success(&lease);
                Ok(submission)
            }
            Err(err) => {
                report_failure(&self.keys, &lease, &err);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
#[path = "chain_test.rs"]
mod tests;
