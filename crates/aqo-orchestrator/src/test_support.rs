//! Scripted provider backends and fixtures shared by unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aqo_core::{
    AnswerPayload, CachedAnalysis, CollectorType, CredentialConfig, KeyStrategy, OperationKeys,
    ProviderConfig, ProviderKind, ProviderPlan, Query, ResultRecord,
};
use aqo_providers::{
    AnalysisBackend, AnswerRequest, BackendRegistry, JobHandle, JobStatus, ProviderBackend,
    ProviderError, Submission,
};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::chain::ProviderChain;
use crate::dispatcher::CollectorDispatcher;
use crate::key_pool::{KeyPool, KeyPoolConfig};
use crate::poller::{AsyncPoller, PollerConfig};
use crate::store::{ExecutionStore, MemoryStore};
use crate::tracker::ExecutionTracker;
use crate::verifier::Verifier;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Answer(&'static str),
    Job(&'static str),
    RateLimited,
    Rejected(u16),
    ServerError,
    Captured(&'static str),
    /// Never answers; only the attempt timeout ends it.
    Hang,
    JobPending,
    JobDone(&'static str),
    JobFailed(&'static str),
}

/// A backend that plays back a fixed script of replies. The last reply
/// repeats once the script runs out.
pub(crate) struct ScriptedBackend {
    name: String,
    submits: Mutex<VecDeque<Reply>>,
    jobs: Mutex<VecDeque<Reply>>,
    submit_calls: AtomicU32,
    job_calls: AtomicU32,
    keys_seen: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub(crate) fn new(name: &str, submits: Vec<Reply>) -> Arc<Self> {
        Self::with_jobs(name, submits, Vec::new())
    }

    pub(crate) fn with_jobs(name: &str, submits: Vec<Reply>, jobs: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            submits: Mutex::new(submits.into()),
            jobs: Mutex::new(jobs.into()),
            submit_calls: AtomicU32::new(0),
            job_calls: AtomicU32::new(0),
            keys_seen: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn job_calls(&self) -> u32 {
        self.job_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn keys_seen(&self) -> Vec<String> {
        self.keys_seen.lock().unwrap().clone()
    }

    fn next(queue: &Mutex<VecDeque<Reply>>) -> Reply {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap_or(Reply::ServerError)
        }
    }

    fn error(&self, reply: &Reply) -> ProviderError {
        match reply {
            Reply::RateLimited => ProviderError::RateLimited {
                provider: self.name.clone(),
                retry_after_secs: None,
            },
            Reply::Rejected(status) => ProviderError::Rejected {
                provider: self.name.clone(),
                status: *status,
                message: "rejected".to_owned(),
            },
            Reply::Captured(message) => ProviderError::Captured {
                provider: self.name.clone(),
                message: (*message).to_owned(),
            },
            _ => ProviderError::Server {
                provider: self.name.clone(),
                status: 500,
            },
        }
    }
}

#[async_trait]
impl ProviderBackend for ScriptedBackend {
    async fn submit(
        &self,
        _request: &AnswerRequest,
        api_key: &str,
    ) -> Result<Submission, ProviderError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.keys_seen.lock().unwrap().push(api_key.to_owned());
        match Self::next(&self.submits) {
            Reply::Answer(text) => Ok(Submission::Immediate(AnswerPayload::text(text))),
            Reply::Job(id) => Ok(Submission::Deferred(JobHandle {
                provider: self.name.clone(),
                job_id: id.to_owned(),
            })),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(self.error(&Reply::ServerError))
            }
            other => Err(self.error(&other)),
        }
    }

    async fn check_job(
        &self,
        _job: &JobHandle,
        _api_key: &str,
    ) -> Result<JobStatus, ProviderError> {
        self.job_calls.fetch_add(1, Ordering::SeqCst);
        match Self::next(&self.jobs) {
            Reply::JobPending => Ok(JobStatus::Pending),
            Reply::JobDone(text) => Ok(JobStatus::Done(AnswerPayload::text(text))),
            Reply::JobFailed(message) => Ok(JobStatus::Failed(message.to_owned())),
            other => Err(self.error(&other)),
        }
    }
}

/// Counts analysis calls; each call yields before answering so concurrent
/// callers overlap.
#[derive(Default)]
pub(crate) struct CountingAnalysis {
    calls: AtomicU32,
}

impl CountingAnalysis {
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisBackend for CountingAnalysis {
    async fn analyze(
        &self,
        result: &ResultRecord,
        _api_key: &str,
    ) -> Result<CachedAnalysis, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut categories = BTreeMap::new();
        categories.insert("https://a.example".to_owned(), "review".to_owned());
        Ok(CachedAnalysis {
            result_id: result.id,
            entities: Vec::new(),
            citation_categories: categories,
            sentiment_by_entity: BTreeMap::new(),
            created_at: Utc::now(),
        })
    }
}

pub(crate) fn provider(name: &str, priority: u16, fallback_on_failure: bool) -> ProviderConfig {
    ProviderConfig {
        name: name.to_owned(),
        service: "svc".to_owned(),
        endpoint: format!("https://{name}.example/answer"),
        status_endpoint: None,
        priority,
        timeout_ms: 1_000,
        retry_count: 0,
        retry_backoff_ms: 0,
        fallback_on_failure,
        kind: ProviderKind::Sync,
        enabled: true,
    }
}

pub(crate) fn async_provider(name: &str, priority: u16) -> ProviderConfig {
    ProviderConfig {
        status_endpoint: Some(format!("https://{name}.example/jobs")),
        kind: ProviderKind::Async,
        ..provider(name, priority, true)
    }
}

pub(crate) fn key_pool(keys: &[&str], fallback: Option<&str>) -> Arc<KeyPool> {
    let mut operations = BTreeMap::new();
    for op in ["svc", "analysis"] {
        operations.insert(
            op.to_owned(),
            OperationKeys {
                keys: keys.iter().map(|k| (*k).to_owned()).collect(),
                fallback: fallback.map(str::to_owned),
            },
        );
    }
    Arc::new(KeyPool::from_credentials(
        &CredentialConfig { operations },
        KeyPoolConfig {
            strategy: KeyStrategy::RoundRobin,
            cooldown: Duration::from_secs(300),
            error_threshold: 5,
        },
    ))
}

pub(crate) fn request(collector: CollectorType) -> AnswerRequest {
    AnswerRequest {
        execution_id: Uuid::new_v4(),
        query_id: Uuid::new_v4(),
        brand_id: Uuid::new_v4(),
        collector,
        query: "best hemp beverages".to_owned(),
    }
}

pub(crate) fn query(collectors: &[CollectorType]) -> Query {
    Query {
        id: Uuid::new_v4(),
        text: "best hemp beverages".to_owned(),
        brand_id: Uuid::new_v4(),
        enabled_collectors: collectors.to_vec(),
    }
}

/// The full dispatch stack over a [`MemoryStore`].
pub(crate) struct Harness {
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) keys: Arc<KeyPool>,
    pub(crate) backends: Arc<BackendRegistry>,
    pub(crate) plan: Arc<ProviderPlan>,
    pub(crate) tracker: ExecutionTracker,
    pub(crate) verifier: Verifier,
    pub(crate) poller: AsyncPoller,
    pub(crate) dispatcher: CollectorDispatcher,
}

pub(crate) fn harness(
    chains: Vec<(CollectorType, Vec<ProviderConfig>)>,
    backends: &[(&str, Arc<ScriptedBackend>)],
    keys: Arc<KeyPool>,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn ExecutionStore> = Arc::clone(&store) as Arc<dyn ExecutionStore>;

    let mut registry = BackendRegistry::new();
    for (name, backend) in backends {
        registry.insert(*name, Arc::clone(backend) as Arc<dyn ProviderBackend>);
    }
    let registry = Arc::new(registry);
    let plan = Arc::new(ProviderPlan::new(chains.into_iter().collect()));

    let tracker = ExecutionTracker::new(Arc::clone(&dyn_store));
    let verifier = Verifier::new(dyn_store, Duration::from_secs(300), Duration::from_secs(600));
    let poller = AsyncPoller::new(
        Arc::clone(&keys),
        Arc::clone(&registry),
        tracker.clone(),
        verifier.clone(),
        PollerConfig {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
        },
    );
    let dispatcher = CollectorDispatcher::new(
        Arc::clone(&plan),
        ProviderChain::new(Arc::clone(&keys), Arc::clone(&registry)),
        tracker.clone(),
        verifier.clone(),
        poller.clone(),
    );

    Harness {
        store,
        keys,
        backends: registry,
        plan,
        tracker,
        verifier,
        poller,
        dispatcher,
    }
}
