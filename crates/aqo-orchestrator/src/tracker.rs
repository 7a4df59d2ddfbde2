//! Execution lifecycle writes.
//!
//! The tracker only ever performs legal transitions
//! (`pending -> running -> completed | failed`). Corrective moves out of a
//! terminal state belong to [`crate::Verifier`].

use std::sync::Arc;

use aqo_core::{
    AnswerPayload, CollectorType, ErrorClass, Execution, ExecutionError, ExecutionStatus,
    ResultRecord,
};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{ExecutionStore, TransitionPatch};

#[derive(Clone)]
pub struct ExecutionTracker {
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionTracker {
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Creates (or returns) the `pending` execution for one collector attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn begin(
        &self,
        run_id: Uuid,
        query_id: Uuid,
        collector: CollectorType,
    ) -> Result<Execution, StoreError> {
        self.store.ensure_execution(run_id, query_id, collector).await
    }

    /// `pending -> running`. Returns `true` only for the caller whose swap
    /// won; a row another caller already started yields `false`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn mark_running(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        self.move_to(
            execution_id,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            TransitionPatch::default(),
        )
        .await
    }

    /// Refreshes `updated_at` on a running execution without changing its
    /// status. Returns `false` if the execution is no longer running.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn touch(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        self.store
            .transition(
                execution_id,
                ExecutionStatus::Running,
                ExecutionStatus::Running,
                TransitionPatch::default(),
            )
            .await
    }

    /// Persists a provider answer and moves the execution to its terminal
    /// state: `completed` for a usable answer, `failed` for one that carries a
    /// failure marker. Returns the stored result, which is the earlier one if
    /// the execution already had a result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the result cannot be stored.
    pub async fn record_result(
        &self,
        execution_id: Uuid,
        payload: &AnswerPayload,
    ) -> Result<ResultRecord, StoreError> {
        let stored = self
            .store
            .insert_result(&ResultRecord::from_payload(execution_id, payload))
            .await?;

        if stored.is_usable() {
            self.move_to(
                execution_id,
                ExecutionStatus::Running,
                ExecutionStatus::Completed,
                TransitionPatch::result(stored.id),
            )
            .await?;
        } else {
            let message = stored.failure.clone().unwrap_or_default();
            self.move_to(
                execution_id,
                ExecutionStatus::Running,
                ExecutionStatus::Failed,
                TransitionPatch::error(ExecutionError::new(
                    None,
                    ErrorClass::CapturedFailure,
                    message,
                )),
            )
            .await?;
        }
        Ok(stored)
    }

    /// `running -> failed` with a structured reason.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn fail(
        &self,
        execution_id: Uuid,
        error: ExecutionError,
    ) -> Result<bool, StoreError> {
        tracing::warn!(
            execution_id = %execution_id,
            error = %error,
            "execution failed"
        );
        self.move_to(
            execution_id,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            TransitionPatch::error(error),
        )
        .await
    }

    async fn move_to(
        &self,
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        patch: TransitionPatch,
    ) -> Result<bool, StoreError> {
        debug_assert!(from.can_transition_to(to));
        let moved = self.store.transition(execution_id, from, to, patch).await?;
        tracing::debug!(
            execution_id = %execution_id,
            from = %from,
            to = %to,
            moved,
            "execution transition"
        );
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn running(store: &Arc<MemoryStore>, tracker: &ExecutionTracker) -> Uuid {
        let exec = tracker
            .begin(Uuid::new_v4(), Uuid::new_v4(), CollectorType::ChatGpt)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(tracker.mark_running(exec.id).await.unwrap());
        assert_eq!(store.executions()[0].status, ExecutionStatus::Running);
        exec.id
    }

    fn tracker() -> (Arc<MemoryStore>, ExecutionTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = ExecutionTracker::new(Arc::clone(&store) as Arc<dyn ExecutionStore>);
        (store, tracker)
    }

    #[tokio::test]
    async fn usable_answer_completes_with_result_reference() {
        let (store, tracker) = tracker();
        let id = running(&store, &tracker).await;

        let stored = tracker
            .record_result(id, &AnswerPayload::text("answer"))
            .await
            .unwrap();

        let exec = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.result_id, Some(stored.id));
        assert!(exec.error.is_none());
    }

    #[tokio::test]
    async fn failure_marker_fails_execution_but_keeps_result() {
        let (store, tracker) = tracker();
        let id = running(&store, &tracker).await;
        let mut payload = AnswerPayload::text("");
        payload.failure = Some("captcha wall".to_owned());

        tracker.record_result(id, &payload).await.unwrap();

        let exec = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.result_id.is_none());
        let err = exec.error.unwrap();
        assert_eq!(err.class, ErrorClass::CapturedFailure);
        assert_eq!(err.message, "captcha wall");
        assert_eq!(store.results().len(), 1);
    }

    #[tokio::test]
    async fn second_mark_running_loses_the_race() {
        let (store, tracker) = tracker();
        let id = running(&store, &tracker).await;
        assert!(!tracker.mark_running(id).await.unwrap());
        let exec = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.version, 1);
    }

    #[tokio::test]
    async fn touch_refreshes_only_running_executions() {
        let (store, tracker) = tracker();
        let id = running(&store, &tracker).await;
        let old = chrono::Utc::now() - chrono::Duration::minutes(10);
        store.set_updated_at(id, old);

        assert!(tracker.touch(id).await.unwrap());
        let exec = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.updated_at > old);
        assert_eq!(exec.version, 2);

        tracker
            .fail(id, ExecutionError::new(Some("p1"), ErrorClass::ProviderTimeout, "gone"))
            .await
            .unwrap();
        assert!(!tracker.touch(id).await.unwrap());
        assert_eq!(
            store.get_execution(id).await.unwrap().unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[tokio::test]
    async fn fail_after_completion_is_a_no_op() {
        let (store, tracker) = tracker();
        let id = running(&store, &tracker).await;
        tracker
            .record_result(id, &AnswerPayload::text("answer"))
            .await
            .unwrap();

        let moved = tracker
            .fail(id, ExecutionError::new(Some("p1"), ErrorClass::ProviderTimeout, "late"))
            .await
            .unwrap();

        assert!(!moved);
        let exec = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }
}
