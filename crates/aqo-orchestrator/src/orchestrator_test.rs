use std::collections::BTreeMap;

use super::*;
use crate::store::{MemoryStore, RunStatus};
use crate::test_support::{
    async_provider, key_pool, provider, query, CountingAnalysis, Reply, ScriptedBackend,
};
use aqo_core::{CollectorType, ErrorClass, ExecutionStatus, ProviderConfig};
use aqo_providers::ProviderBackend;

struct Setup {
    store: Arc<MemoryStore>,
    orchestrator: Orchestrator,
}

fn setup(
    chains: Vec<(CollectorType, Vec<ProviderConfig>)>,
    backends: &[(&str, Arc<ScriptedBackend>)],
    keys: Arc<KeyPool>,
    settings: OrchestratorSettings,
) -> Setup {
    let store = Arc::new(MemoryStore::new());
    let mut registry = BackendRegistry::new();
    for (name, backend) in backends {
        registry.insert(*name, Arc::clone(backend) as Arc<dyn ProviderBackend>);
    }
    let plan = ProviderPlan::new(chains.into_iter().collect::<BTreeMap<_, _>>());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        plan,
        registry,
        keys,
        Some(Arc::new(CountingAnalysis::default()) as Arc<dyn AnalysisBackend>),
        settings,
    )
    .unwrap();
    Setup {
        store,
        orchestrator,
    }
}

fn quick() -> OrchestratorSettings {
    OrchestratorSettings {
        inter_batch_cooldown: Duration::ZERO,
        ..OrchestratorSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_a_seven_queries_three_per_batch() {
    let p1 = ScriptedBackend::new("p1", vec![Reply::Answer("answer")]);
    let s = setup(
        vec![(CollectorType::ChatGpt, vec![provider("p1", 1, true)])],
        &[("p1", p1)],
        key_pool(&["k1"], None),
        OrchestratorSettings::default(),
    );
    let queries: Vec<Query> = (0..7).map(|_| query(&[CollectorType::ChatGpt])).collect();

    let summary = s.orchestrator.submit_batch(&queries).await.unwrap();

    assert_eq!(summary.batch_sizes, vec![3, 3, 1]);
    assert_eq!((summary.succeeded, summary.failed), (7, 0));
    let executions = s.store.executions();
    assert_eq!(executions.len(), 7);
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Completed));
    assert_eq!(s.store.results().len(), 7);

    let run = s
        .orchestrator
        .get_run(executions[0].run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.trigger_source, "api");
    assert_eq!(run.succeeded_count, 7);
}

#[tokio::test]
async fn scenario_b_failed_chain_beside_healthy_collector() {
    let a1 = ScriptedBackend::new("a1", vec![Reply::ServerError]);
    let a2 = ScriptedBackend::new("a2", vec![Reply::ServerError]);
    let b1 = ScriptedBackend::new("b1", vec![Reply::Answer("fine")]);
    let s = setup(
        vec![
            (
                CollectorType::Gemini,
                vec![provider("a1", 1, true), provider("a2", 2, false)],
            ),
            (CollectorType::Claude, vec![provider("b1", 1, true)]),
        ],
        &[("a1", a1.clone()), ("a2", a2.clone()), ("b1", b1)],
        key_pool(&["k1"], None),
        quick(),
    );

    let summary = s
        .orchestrator
        .submit_batch(&[query(&[CollectorType::Gemini, CollectorType::Claude])])
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(a1.submit_calls() + a2.submit_calls(), 2);
    let executions = s.store.executions();
    let gemini = executions
        .iter()
        .find(|e| e.collector_type == CollectorType::Gemini)
        .unwrap();
    let claude = executions
        .iter()
        .find(|e| e.collector_type == CollectorType::Claude)
        .unwrap();
    assert_eq!(gemini.status, ExecutionStatus::Failed);
    assert_eq!(gemini.error.as_ref().unwrap().provider.as_deref(), Some("a2"));
    assert_eq!(claude.status, ExecutionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_async_job_completes_on_second_poll() {
    let p1 = ScriptedBackend::with_jobs(
        "p1",
        vec![Reply::Job("job-c")],
        vec![Reply::JobPending, Reply::JobDone("deferred answer")],
    );
    let s = setup(
        vec![(CollectorType::Perplexity, vec![async_provider("p1", 1)])],
        &[("p1", p1.clone())],
        key_pool(&["k1"], None),
        quick(),
    );

    let summary = s
        .orchestrator
        .submit_batch(&[query(&[CollectorType::Perplexity])])
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);

    let id = s.store.executions()[0].id;
    let view = s.orchestrator.get_execution_status(id).await.unwrap().unwrap();
    assert_eq!(view.status, ExecutionStatus::Running);
    assert_eq!(s.orchestrator.pending_jobs(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    assert_eq!(
        s.orchestrator.get_execution_status(id).await.unwrap().unwrap().status,
        ExecutionStatus::Running,
        "first poll only reports pending"
    );

    s.orchestrator.shutdown().await;

    let view = s.orchestrator.get_execution_status(id).await.unwrap().unwrap();
    assert_eq!(view.status, ExecutionStatus::Completed);
    let result = s.store.find_result(id).await.unwrap().unwrap();
    assert_eq!(view.result_id, Some(result.id));
    assert_eq!(result.text, "deferred answer");
    assert_eq!(p1.job_calls(), 2);
}

#[tokio::test]
async fn scenario_d_sweep_fails_stuck_execution() {
    let s = setup(Vec::new(), &[], key_pool(&["k1"], None), quick());
    let exec = s
        .store
        .ensure_execution(Uuid::new_v4(), Uuid::new_v4(), CollectorType::Grok)
        .await
        .unwrap();
    s.store
        .transition(
            exec.id,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            crate::store::TransitionPatch::default(),
        )
        .await
        .unwrap();
    s.store
        .set_updated_at(exec.id, chrono::Utc::now() - chrono::Duration::minutes(10));

    let first = s.orchestrator.sweep_once().await.unwrap();
    let after_first = s.orchestrator.get_execution_status(exec.id).await.unwrap();
    let second = s.orchestrator.sweep_once().await.unwrap();
    let after_second = s.orchestrator.get_execution_status(exec.id).await.unwrap();

    assert_eq!(first.failed, 1);
    assert_eq!(second.corrections(), 0);
    assert_eq!(after_first, after_second);
    let view = after_second.unwrap();
    assert_eq!(view.status, ExecutionStatus::Failed);
    let err = view.error.unwrap();
    assert_eq!(err.class, ErrorClass::TimedOutNoResult);
    assert_eq!(err.message, "timed out with no result");
}

#[tokio::test]
async fn scenario_e_rate_limited_pool_uses_fallback_key() {
    let p1 = ScriptedBackend::new("p1", vec![Reply::Answer("via fallback")]);
    let keys = key_pool(&["k1", "k2", "k3"], Some("fb"));
    for _ in 0..3 {
        let lease = keys.acquire("svc").unwrap();
        keys.report_rate_limited(&lease, None);
    }
    let s = setup(
        vec![(CollectorType::Copilot, vec![provider("p1", 1, true)])],
        &[("p1", p1.clone())],
        keys,
        quick(),
    );

    let summary = s
        .orchestrator
        .submit_batch(&[query(&[CollectorType::Copilot])])
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(p1.keys_seen(), vec!["fb"]);
    let snapshot = s.orchestrator.key_snapshot();
    let fallback = snapshot
        .iter()
        .find(|k| k.operation == "svc" && k.is_fallback)
        .unwrap();
    assert_eq!(fallback.success_count, 1);
}

#[tokio::test]
async fn run_where_every_query_fails_is_marked_failed() {
    let p1 = ScriptedBackend::new("p1", vec![Reply::Rejected(400)]);
    let s = setup(
        vec![(CollectorType::ChatGpt, vec![provider("p1", 1, true)])],
        &[("p1", p1)],
        key_pool(&["k1"], None),
        quick(),
    );

    let summary = s
        .orchestrator
        .submit_batch_with_trigger(&[query(&[CollectorType::ChatGpt])], "scheduler")
        .await
        .unwrap();

    assert_eq!((summary.succeeded, summary.failed), (0, 1));
    let run = s
        .orchestrator
        .get_run(s.store.executions()[0].run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.trigger_source, "scheduler");
    assert_eq!(run.failed_count, 1);
}

#[tokio::test]
async fn completed_result_feeds_the_analysis_cache() {
    let p1 = ScriptedBackend::new("p1", vec![Reply::Answer("brand y is popular")]);
    let s = setup(
        vec![(CollectorType::ChatGpt, vec![provider("p1", 1, true)])],
        &[("p1", p1)],
        key_pool(&["k1"], None),
        quick(),
    );
    s.orchestrator
        .submit_batch(&[query(&[CollectorType::ChatGpt])])
        .await
        .unwrap();
    let id = s.store.executions()[0].id;
    let result_id = s
        .orchestrator
        .get_execution_status(id)
        .await
        .unwrap()
        .unwrap()
        .result_id
        .unwrap();

    let first = s.orchestrator.cache().get_or_compute(result_id).await.unwrap();
    let second = s.orchestrator.cache().get_or_compute(result_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(s.store.analysis_count(), 1);
}

#[tokio::test]
async fn unknown_execution_has_no_status() {
    let s = setup(Vec::new(), &[], key_pool(&["k1"], None), quick());
    assert!(s
        .orchestrator
        .get_execution_status(Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn shutdown_refuses_new_batches() {
    let s = setup(Vec::new(), &[], key_pool(&["k1"], None), quick());
    s.orchestrator.shutdown().await;
    assert!(matches!(
        s.orchestrator.submit_batch(&[query(&[CollectorType::ChatGpt])]).await,
        Err(OrchestratorError::ShuttingDown)
    ));
}

#[test]
fn zero_batch_size_is_rejected_at_construction() {
    let settings = OrchestratorSettings {
        batch_size: 0,
        ..OrchestratorSettings::default()
    };
    let result = Orchestrator::new(
        Arc::new(MemoryStore::new()),
        ProviderPlan::default(),
        BackendRegistry::new(),
        key_pool(&["k1"], None),
        None,
        settings,
    );
    assert!(matches!(result, Err(OrchestratorError::InvalidBatchSize)));
}

#[tokio::test]
async fn reset_key_returns_a_rejected_key_to_service() {
    let p1 = ScriptedBackend::new("p1", vec![Reply::Answer("ok")]);
    let keys = key_pool(&["k1"], None);
    let lease = keys.acquire("svc").unwrap();
    keys.report_hard_error(&lease, true);
    let s = setup(
        vec![(CollectorType::ChatGpt, vec![provider("p1", 1, true)])],
        &[("p1", p1.clone())],
        keys,
        quick(),
    );

    let before = s
        .orchestrator
        .submit_batch(&[query(&[CollectorType::ChatGpt])])
        .await
        .unwrap();
    assert_eq!(before.failed, 1);
    assert_eq!(p1.submit_calls(), 0);

    assert!(s.orchestrator.reset_key("svc", lease.fingerprint()));
    assert!(!s.orchestrator.reset_key("svc", "unknown"));

    let after = s
        .orchestrator
        .submit_batch(&[query(&[CollectorType::ChatGpt])])
        .await
        .unwrap();
    assert_eq!(after.succeeded, 1);
    assert_eq!(p1.keys_seen(), vec!["k1"]);
}
