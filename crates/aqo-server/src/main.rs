mod scheduler;

use std::sync::Arc;

use anyhow::Context;
use aqo_core::AppConfig;
use aqo_orchestrator::{KeyPool, KeyPoolConfig, Orchestrator, OrchestratorSettings, PgStore};
use aqo_providers::{AnalysisBackend, BackendRegistry, HttpAnalysisClient};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "aqo-server")]
#[command(about = "Answer query orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the periodic sweep and scheduled collections until interrupted.
    Serve,
    /// Run one collection over the active queries, drain async jobs, exit.
    Collect {
        /// Maximum number of active queries to load.
        #[arg(long, default_value_t = scheduler::COLLECT_QUERY_LIMIT)]
        limit: i64,
    },
    /// Run one verifier sweep and exit.
    Sweep,
    /// Print one execution's status as JSON.
    Status { execution_id: Uuid },
    /// Print the configured key pool as JSON, fingerprints only.
    Keys,
    /// List the most recent collection runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List every execution created by one collection run.
    Run { run_id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = Arc::new(aqo_core::load_app_config()?);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let pool_config = aqo_db::PoolConfig::from_app_config(&config);
    let pool = aqo_db::connect_pool(&config.database_url, pool_config).await?;
    aqo_db::run_migrations(&pool).await?;

    let orchestrator = Arc::new(build_orchestrator(&config, pool.clone())?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(orchestrator, pool, config).await?,
        Commands::Collect { limit } => {
            let queries = aqo_db::list_active_queries(&pool, limit).await?;
            let summary = orchestrator
                .submit_batch_with_trigger(&queries, "cli")
                .await?;
            orchestrator.shutdown().await;
            println!(
                "collected {} queries: {} succeeded, {} failed in {} batches",
                queries.len(),
                summary.succeeded,
                summary.failed,
                summary.batch_sizes.len()
            );
        }
        Commands::Sweep => {
            let report = orchestrator.sweep_once().await?;
            println!(
                "examined {}: {} completed, {} failed, {} healed",
                report.examined, report.completed, report.failed, report.healed
            );
        }
        Commands::Status { execution_id } => {
            let Some(view) = orchestrator.get_execution_status(execution_id).await? else {
                anyhow::bail!("execution {execution_id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Keys => {
            println!(
                "{}",
                serde_json::to_string_pretty(&orchestrator.key_snapshot())?
            );
        }
        Commands::Runs { limit } => {
            for run in aqo_db::list_collection_runs(&pool, limit).await? {
                println!(
                    "{}  {:<9}  {:<9}  queries={} ok={} failed={}  {}",
                    run.id,
                    run.status,
                    run.trigger_source,
                    run.query_count,
                    run.succeeded_count,
                    run.failed_count,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Run { run_id } => {
            let executions = aqo_db::list_run_executions(&pool, run_id).await?;
            if executions.is_empty() {
                anyhow::bail!("no executions for run {run_id}");
            }
            for exec in executions {
                let detail = exec
                    .error
                    .as_ref()
                    .map_or_else(String::new, ToString::to_string);
                println!(
                    "{}  {:<10}  {:<9}  {}",
                    exec.id, exec.collector_type, exec.status, detail
                );
            }
        }
    }

    Ok(())
}

fn build_orchestrator(config: &AppConfig, pool: PgPool) -> anyhow::Result<Orchestrator> {
    let collectors = aqo_core::load_collectors(&config.collectors_path)
        .with_context(|| format!("loading {}", config.collectors_path.display()))?;
    let plan = collectors.resolve();

    let credentials = aqo_core::load_credentials()?;
    let keys = Arc::new(KeyPool::from_credentials(
        &credentials,
        KeyPoolConfig::from_app_config(config),
    ));
    for service in plan.services() {
        if !keys.has_operation(service) {
            tracing::warn!(
                operation = service,
                "no credentials configured; providers using this operation will fail"
            );
        }
    }

    let client = aqo_providers::build_http_client(&config.http_user_agent)?;
    let backends = BackendRegistry::from_plan(&plan, &client)?;

    let analysis: Option<Arc<dyn AnalysisBackend>> = match config.analysis_url.as_deref() {
        Some(url) => Some(Arc::new(HttpAnalysisClient::new(client, url)?)),
        None => None,
    };
    if analysis.is_none() {
        tracing::info!("AQO_ANALYSIS_URL not set; analysis cache will serve stored entries only");
    }

    tracing::info!(
        providers = backends.len(),
        batch_size = config.batch_size,
        key_strategy = ?config.key_strategy,
        "orchestrator configured"
    );

    Ok(Orchestrator::new(
        Arc::new(PgStore::new(pool)),
        plan,
        backends,
        keys,
        analysis,
        OrchestratorSettings::from_app_config(config),
    )?)
}

async fn serve(
    orchestrator: Arc<Orchestrator>,
    pool: PgPool,
    config: Arc<AppConfig>,
) -> anyhow::Result<()> {
    let collections = TaskTracker::new();
    let mut scheduler = scheduler::build_scheduler(
        Arc::clone(&orchestrator),
        pool,
        config,
        collections.clone(),
    )
    .await?;
    tracing::info!("aqo-server running");

    shutdown_signal().await;

    scheduler.shutdown().await?;
    collections.close();
    collections.wait().await;
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, draining in-flight work");
}
