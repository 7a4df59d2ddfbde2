//! Background job scheduler.
//!
//! Registers the periodic verifier sweep and the cron-driven collection
//! pass. Collections run on a [`TaskTracker`] so shutdown can wait for them.

use std::sync::Arc;
use std::time::Duration;

use aqo_core::AppConfig;
use aqo_orchestrator::Orchestrator;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::task::TaskTracker;

/// Upper bound on queries loaded for one scheduled collection.
pub const COLLECT_QUERY_LIMIT: i64 = 10_000;

/// Builds and starts the background job scheduler.
///
/// Returns the running [`JobScheduler`] handle, which must be kept alive
/// for the lifetime of the process.
///
/// # Errors
///
/// Returns [`JobSchedulerError`] if the scheduler cannot be initialised,
/// a job cannot be registered, or the scheduler fails to start.
pub async fn build_scheduler(
    orchestrator: Arc<Orchestrator>,
    pool: PgPool,
    config: Arc<AppConfig>,
    collections: TaskTracker,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    register_sweep_job(&scheduler, Arc::clone(&orchestrator), config.sweep_interval()).await?;
    register_collect_job(
        &scheduler,
        orchestrator,
        pool,
        &config.collect_cron,
        collections,
    )
    .await?;

    scheduler.start().await?;
    Ok(scheduler)
}

/// Safety-net sweep every `interval` (default five minutes).
async fn register_sweep_job(
    scheduler: &JobScheduler,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            match orchestrator.sweep_once().await {
                Ok(report) if report.corrections() > 0 => {
                    tracing::info!(
                        completed = report.completed,
                        failed = report.failed,
                        healed = report.healed,
                        "scheduler: sweep corrected executions"
                    );
                }
                Ok(_) => tracing::debug!("scheduler: sweep found nothing to correct"),
                Err(e) => tracing::error!(error = %e, "scheduler: sweep failed"),
            }
        })
    })?;

    scheduler.add(job).await?;
    tracing::info!(interval_secs = interval.as_secs(), "scheduler: sweep registered");
    Ok(())
}

/// Collection over every active query on `cron`.
async fn register_collect_job(
    scheduler: &JobScheduler,
    orchestrator: Arc<Orchestrator>,
    pool: PgPool,
    cron: &str,
    collections: TaskTracker,
) -> Result<(), JobSchedulerError> {
    let pool = Arc::new(pool);

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let orchestrator = Arc::clone(&orchestrator);
        let pool = Arc::clone(&pool);
        let collections = collections.clone();

        Box::pin(async move {
            if collections.is_closed() {
                return;
            }
            if !collections.is_empty() {
                tracing::warn!("scheduler: previous collection still running; skipping");
                return;
            }
            collections
                .track_future(run_collection(&orchestrator, &pool))
                .await;
        })
    })?;

    scheduler.add(job).await?;
    tracing::info!(cron, "scheduler: collection registered");
    Ok(())
}

async fn run_collection(orchestrator: &Orchestrator, pool: &PgPool) {
    let queries = match aqo_db::list_active_queries(pool, COLLECT_QUERY_LIMIT).await {
        Ok(q) => q,
        Err(e) => {
            tracing::error!(error = %e, "scheduler: failed to load active queries");
            return;
        }
    };

    if queries.is_empty() {
        tracing::info!("scheduler: no active queries; skipping collection");
        return;
    }

    tracing::info!(count = queries.len(), "scheduler: starting collection");
    match orchestrator
        .submit_batch_with_trigger(&queries, "scheduler")
        .await
    {
        Ok(summary) => tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "scheduler: collection complete"
        ),
        Err(e) => tracing::error!(error = %e, "scheduler: collection failed"),
    }
}
