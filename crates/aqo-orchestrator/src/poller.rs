//! Completion path for deferred provider jobs.
//!
//! The dispatcher hands every deferred job to [`AsyncPoller::watch`] and
//! returns immediately. Each watched job gets one task that checks the job
//! status every `interval` until the job settles or `max_wait` has elapsed.
//! Tasks run on a [`TaskTracker`] so shutdown can drain them.

use std::sync::Arc;
use std::time::Duration;

use aqo_core::{AppConfig, ErrorClass, ExecutionError, ProviderConfig};
use aqo_providers::{BackendRegistry, JobHandle, JobStatus, ProviderError};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::chain::report_failure;
use crate::key_pool::KeyPool;
use crate::tracker::ExecutionTracker;
use crate::verifier::Verifier;

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl PollerConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_wait: config.poll_max_wait(),
        }
    }
}

#[derive(Debug, Error)]
enum PollError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{0}")]
    Unavailable(String),
}

struct PollerInner {
    keys: Arc<KeyPool>,
    backends: Arc<BackendRegistry>,
    tracker: ExecutionTracker,
    verifier: Verifier,
    config: PollerConfig,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct AsyncPoller {
    inner: Arc<PollerInner>,
}

impl AsyncPoller {
    #[must_use]
    pub fn new(
        keys: Arc<KeyPool>,
        backends: Arc<BackendRegistry>,
        tracker: ExecutionTracker,
        verifier: Verifier,
        config: PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                keys,
                backends,
                tracker,
                verifier,
                config,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Starts polling `job` on behalf of `execution_id`. Returns `false` once
    /// the poller is shutting down; watching an execution that is already
    /// watched is a no-op that returns `true`. While watched, the execution
    /// is exempt from the sweep's timeout.
    pub fn watch(&self, execution_id: Uuid, provider: ProviderConfig, job: JobHandle) -> bool {
        if self.inner.tasks.is_closed() {
            tracing::warn!(
                execution_id = %execution_id,
                job_id = %job.job_id,
                "poller is shutting down; refusing new job"
            );
            return false;
        }
        if !self.inner.verifier.watched().insert(execution_id) {
            return true;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            inner.poll_until_settled(execution_id, &provider, &job).await;
            inner.verifier.watched().remove(execution_id);
        });
        true
    }

    /// Jobs currently being polled.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Refuses new jobs and waits for every watched job to settle.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        let pending = self.inner.tasks.len();
        if pending > 0 {
            tracing::info!(pending, "draining async pollers");
        }
        self.inner.tasks.wait().await;
    }
}

impl PollerInner {
    async fn poll_until_settled(
        &self,
        execution_id: Uuid,
        provider: &ProviderConfig,
        job: &JobHandle,
    ) {
        let started = Instant::now();
        let mut polls = 0u32;

        loop {
            tokio::time::sleep(self.config.interval).await;
            polls += 1;

            match self.tracker.store().get_execution(execution_id).await {
                Ok(Some(exec)) if exec.status.is_terminal() => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        status = %exec.status,
                        "execution already settled; stopping poll"
                    );
                    return;
                }
                Ok(None) => {
                    tracing::warn!(execution_id = %execution_id, "polled execution vanished");
                    return;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        error = %e,
                        "could not read execution before poll"
                    );
                }
            }

            match self.check_once(provider, job).await {
                Ok(JobStatus::Done(payload)) => {
                    tracing::info!(
                        execution_id = %execution_id,
                        provider = %provider.name,
                        job_id = %job.job_id,
                        polls,
                        "async job finished"
                    );
                    if let Err(e) = self.tracker.record_result(execution_id, &payload).await {
                        tracing::error!(
                            execution_id = %execution_id,
                            error = %e,
                            "failed to record async result"
                        );
                    }
                    if let Err(e) = self.verifier.verify_execution(execution_id).await {
                        tracing::warn!(
                            execution_id = %execution_id,
                            error = %e,
                            "post-poll verification failed"
                        );
                    }
                    return;
                }
                Ok(JobStatus::Failed(message)) => {
                    self.settle_failed(
                        execution_id,
                        ExecutionError::new(
                            Some(&provider.name),
                            ErrorClass::AsyncJobFailed,
                            message,
                        ),
                    )
                    .await;
                    return;
                }
                Ok(JobStatus::Pending) => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        job_id = %job.job_id,
                        polls,
                        "job still pending"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        job_id = %job.job_id,
                        polls,
                        error = %e,
                        "job status check failed"
                    );
                }
            }

            if started.elapsed() >= self.config.max_wait {
                self.settle_failed(
                    execution_id,
                    ExecutionError::new(
                        Some(&provider.name),
                        ErrorClass::AsyncJobAbandoned,
                        format!(
                            "job {} not finished after {}s",
                            job.job_id,
                            self.config.max_wait.as_secs()
                        ),
                    ),
                )
                .await;
                return;
            }
        }
    }

    async fn check_once(
        &self,
        provider: &ProviderConfig,
        job: &JobHandle,
    ) -> Result<JobStatus, PollError> {
        let backend = self.backends.get(&provider.name).ok_or_else(|| {
            PollError::Unavailable(format!(
                "no backend registered for provider '{}'",
                provider.name
            ))
        })?;
        let lease = self
            .keys
            .acquire(&provider.service)
            .map_err(|e| PollError::Unavailable(e.to_string()))?;

        let check = backend.check_job(job, lease.secret());
        let outcome = tokio::time::timeout(provider.timeout(), check)
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Timeout {
                    provider: provider.name.clone(),
                    timeout_ms: provider.timeout_ms,
                })
            });

        match outcome {
            Ok(status) => {
                self.keys.report_success(&lease);
                Ok(status)
            }
            Err(e) => {
                report_failure(&self.keys, &lease, &e);
                Err(e.into())
            }
        }
    }

    async fn settle_failed(&self, execution_id: Uuid, error: ExecutionError) {
        if let Err(e) = self.tracker.fail(execution_id, error).await {
            tracing::error!(
                execution_id = %execution_id,
                error = %e,
                "failed to record async job failure"
            );
        }
    }
}
