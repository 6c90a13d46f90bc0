use std::sync::Arc;

use crate::commands::{load_config, open_pool, runtime, CommandResult, Failure};
use gradplan_agent::{
    GenerationJobService, OpenAiCompatibleClient, RuntimeInit, ServiceDependencies,
    ServiceSettings, WorkerCycleReport, WorkerCycleRunner, WorkerPool,
};
use gradplan_core::config::AppConfig;
use gradplan_core::generation_engine::GenerationEngine;
use gradplan_db::repositories::{SqlCatalogRepository, SqlConversationRepository, SqlJobRepository};
use gradplan_db::{migrations, DbPool};

/// One pass of the worker cycle for cron-style schedulers that cannot reach the HTTP endpoint.
pub fn run(limit: Option<u32>) -> CommandResult {
    match cycle(limit) {
        Ok((effective_limit, report)) => CommandResult::success(
            "worker-cycle",
            format!(
                "limit {effective_limit}: processed {} jobs, recovered {} stale claims",
                report.processed, report.recovered
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("worker-cycle", error_class, message, exit_code)
        }
    }
}

fn cycle(limit: Option<u32>) -> Result<(u32, WorkerCycleReport), Failure> {
    let config = load_config()?;
    let reasoning = OpenAiCompatibleClient::from_config(&config.llm)
        .map_err(|error| ("config_validation", error.to_string(), 2u8))?;
    let runtime = runtime()?;

    let report = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let outcome = drive_cycle(&config, pool.clone(), reasoning, limit).await;
        pool.close().await;
        outcome
    })?;

    Ok((config.worker.effective_limit(limit), report))
}

async fn drive_cycle(
    config: &AppConfig,
    pool: DbPool,
    reasoning: OpenAiCompatibleClient,
    limit: Option<u32>,
) -> Result<WorkerCycleReport, Failure> {
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
    let service = service(config, pool, reasoning)?;
    WorkerCycleRunner::new(service, config.worker.clone())
        .run_cycle(limit)
        .await
        .map_err(|error| ("worker_cycle", error.to_string(), 3))
}

fn service(
    config: &AppConfig,
    pool: DbPool,
    reasoning: OpenAiCompatibleClient,
) -> Result<Arc<GenerationJobService>, Failure> {
    GenerationJobService::new(
        ServiceDependencies {
            jobs: Arc::new(SqlJobRepository::new(pool.clone())),
            conversations: Arc::new(SqlConversationRepository::new(pool.clone())),
            catalog: Arc::new(SqlCatalogRepository::new(pool)),
            reasoning: Arc::new(reasoning),
            runtime: Arc::new(RuntimeInit::default()),
        },
        GenerationEngine::with_config(config.worker.engine_config()),
        ServiceSettings::from_config(config),
        WorkerPool::new(config.worker.concurrency as usize),
    )
    .map(Arc::new)
    .map_err(|error| ("service_init", error.to_string(), 3))
}
