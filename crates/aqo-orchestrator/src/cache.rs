//! Get-or-compute cache of consolidated analyses, keyed by result id.
//!
//! The first caller for a result makes the single analysis call and stores
//! the payload; every later caller reads it back. Concurrent callers for the
//! same result share one in-flight computation through a per-key
//! [`OnceCell`]. Entries never expire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aqo_core::CachedAnalysis;
use aqo_providers::AnalysisBackend;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::chain::report_failure;
use crate::error::CacheError;
use crate::key_pool::KeyPool;
use crate::store::{AnalysisStore, ExecutionStore};

type Inflight = Mutex<HashMap<Uuid, Arc<OnceCell<CachedAnalysis>>>>;

pub struct ResultCache {
    results: Arc<dyn ExecutionStore>,
    analyses: Arc<dyn AnalysisStore>,
    backend: Option<Arc<dyn AnalysisBackend>>,
    keys: Arc<KeyPool>,
    service: String,
    inflight: Inflight,
}

impl ResultCache {
    /// `service` is the key-pool operation used for analysis calls. Without
    /// a `backend` the cache still serves stored entries but cannot compute.
    #[must_use]
    pub fn new(
        results: Arc<dyn ExecutionStore>,
        analyses: Arc<dyn AnalysisStore>,
        backend: Option<Arc<dyn AnalysisBackend>>,
        keys: Arc<KeyPool>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            results,
            analyses,
            backend,
            keys,
            service: service.into(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Stored analysis for `result_id`, if one has been computed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store is unreachable.
    pub async fn get(&self, result_id: Uuid) -> Result<Option<CachedAnalysis>, CacheError> {
        Ok(self.analyses.get_analysis(result_id).await?)
    }

    /// Returns the analysis for `result_id`, computing and storing it on the
    /// first call.
    ///
    /// # Errors
    ///
    /// - [`CacheError::ResultNotFound`] if no such result exists.
    /// - [`CacheError::NoBackend`] if computing is needed but no backend is set.
    /// - [`CacheError::KeyPool`] or [`CacheError::Provider`] if the analysis call fails.
    /// - [`CacheError::Store`] if the store is unreachable.
    pub async fn get_or_compute(&self, result_id: Uuid) -> Result<CachedAnalysis, CacheError> {
        if let Some(hit) = self.analyses.get_analysis(result_id).await? {
            tracing::debug!(result_id = %result_id, "analysis cache hit");
            return Ok(hit);
        }

        let cell = Arc::clone(
            self.inflight_map()
                .entry(result_id)
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );
        let outcome = cell
            .get_or_try_init(|| self.compute(result_id))
            .await
            .cloned();

        {
            let mut map = self.inflight_map();
            if map.get(&result_id).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                map.remove(&result_id);
            }
        }
        outcome
    }

    fn inflight_map(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<OnceCell<CachedAnalysis>>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn compute(&self, result_id: Uuid) -> Result<CachedAnalysis, CacheError> {
        if let Some(hit) = self.analyses.get_analysis(result_id).await? {
            return Ok(hit);
        }
        let backend = self.backend.as_ref().ok_or(CacheError::NoBackend)?;
        let result = self
            .results
            .get_result(result_id)
            .await?
            .ok_or(CacheError::ResultNotFound(result_id))?;

        let lease = self.keys.acquire(&self.service)?;
        let analysis = match backend.analyze(&result, lease.secret()).await {
            Ok(analysis) => {
                self.keys.report_success(&lease);
                analysis
            }
            Err(e) => {
                report_failure(&self.keys, &lease, &e);
                return Err(e.into());
            }
        };

        let stored = self.analyses.insert_analysis_if_absent(&analysis).await?;
        tracing::info!(
            result_id = %result_id,
            entities = stored.entities.len(),
            "analysis computed and cached"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{key_pool, CountingAnalysis};
    use aqo_core::{AnswerPayload, CollectorType, ResultRecord};

    async fn stored_result(store: &MemoryStore) -> Uuid {
        let exec = store
            .ensure_execution(Uuid::new_v4(), Uuid::new_v4(), CollectorType::ChatGpt)
            .await
            .unwrap();
        store
            .insert_result(&ResultRecord::from_payload(
                exec.id,
                &AnswerPayload::text("brand x leads"),
            ))
            .await
            .unwrap()
            .id
    }

    fn cache(store: &Arc<MemoryStore>, backend: Option<Arc<CountingAnalysis>>) -> Arc<ResultCache> {
        Arc::new(ResultCache::new(
            Arc::clone(store) as Arc<dyn ExecutionStore>,
            Arc::clone(store) as Arc<dyn AnalysisStore>,
            backend.map(|b| b as Arc<dyn AnalysisBackend>),
            key_pool(&["k1"], None),
            "analysis",
        ))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(CountingAnalysis::default());
        let cache = cache(&store, Some(Arc::clone(&backend)));
        let result_id = stored_result(&store).await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_compute(result_id).await.unwrap() })
            })
            .collect();
        let mut analyses = Vec::new();
        for handle in handles {
            analyses.push(handle.await.unwrap());
        }

        assert_eq!(backend.calls(), 1);
        assert!(analyses.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.analysis_count(), 1);
    }

    #[tokio::test]
    async fn later_callers_read_the_stored_entry() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(CountingAnalysis::default());
        let cache = cache(&store, Some(Arc::clone(&backend)));
        let result_id = stored_result(&store).await;

        let first = cache.get_or_compute(result_id).await.unwrap();
        let second = cache.get_or_compute(result_id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
        assert_eq!(cache.get(result_id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn unknown_result_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store, Some(Arc::new(CountingAnalysis::default())));
        let missing = Uuid::new_v4();
        assert!(matches!(
            cache.get_or_compute(missing).await,
            Err(CacheError::ResultNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn missing_backend_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store, None);
        let result_id = stored_result(&store).await;
        assert!(matches!(
            cache.get_or_compute(result_id).await,
            Err(CacheError::NoBackend)
        ));
    }
}
