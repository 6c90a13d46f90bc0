use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use gradplan_agent::{
    GenerationJobService, ReasoningReply, RunOutcome, RuntimeInit, ScriptedReasoningClient,
    ServiceDependencies, ServiceSettings, WorkerPool,
};
use gradplan_core::config::{AppConfig, LoadOptions};
use gradplan_core::domain::job::UserId;
use gradplan_core::generation_engine::GenerationEngine;
use gradplan_db::repositories::{SqlCatalogRepository, SqlConversationRepository, SqlJobRepository};
use gradplan_db::{connect_with_settings, migrations, DbPool, DemoCatalog};
use serde::Serialize;
use serde_json::json;

use crate::commands::CommandResult;

const CHECKS: [&str; 5] =
    ["config_validation", "db_migrations", "demo_catalog", "tool_catalog", "scripted_plan_run"];

const SMOKE_CONVERSATION: &str = "smoke-conversation";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

/// Runs the demo catalog through a full scripted conversation on a throwaway database.
///
/// Only `config_validation` reads the configured environment; everything after it runs
/// in memory, so the command is safe to point at a production config.
pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let clock = Instant::now();
    let config = record(
        &mut checks,
        "config_validation",
        clock,
        AppConfig::load(LoadOptions::default())
            .map(|config| (config, "configuration loaded and validated".to_string()))
            .map_err(anyhow::Error::from),
    );

    if let Some(config) = config {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(in_memory_checks(&config, &mut checks)),
            Err(error) => checks.push(SmokeCheck {
                name: "db_migrations",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            }),
        }
    }

    for name in CHECKS.iter().skip(checks.len()) {
        checks.push(skipped(name));
    }
    finalize_report(checks, started.elapsed().as_millis() as u64)
}

async fn in_memory_checks(config: &AppConfig, checks: &mut Vec<SmokeCheck>) {
    let clock = Instant::now();
    let Some(pool) = record(checks, "db_migrations", clock, prepare_database(config).await) else {
        return;
    };

    let clock = Instant::now();
    if record(checks, "demo_catalog", clock, load_demo_catalog(&pool).await).is_some() {
        let clock = Instant::now();
        if let Some(service) = record(checks, "tool_catalog", clock, build_service(config, &pool))
        {
            let clock = Instant::now();
            record(checks, "scripted_plan_run", clock, scripted_plan_run(&service).await);
        }
    }

    pool.close().await;
}

async fn prepare_database(config: &AppConfig) -> anyhow::Result<(DbPool, String)> {
    let pool = connect_with_settings("sqlite::memory:", 1, config.database.timeout_secs)
        .await
        .context("failed to open in-memory database")?;
    migrations::run_pending(&pool).await.context("migration execution failed")?;
    let applied = migrations::known_versions().len();
    Ok((pool, format!("{applied} migrations applied to an in-memory database")))
}

async fn load_demo_catalog(pool: &DbPool) -> anyhow::Result<((), String)> {
    let seeded = DemoCatalog::load(pool).await.context("demo catalog load failed")?;
    let verification = DemoCatalog::verify(pool).await.context("demo catalog check failed")?;
    if !verification.all_present {
        let failed = verification
            .checks
            .iter()
            .filter_map(|(name, ok)| (!ok).then_some(name.as_str()))
            .collect::<Vec<_>>();
        bail!("demo catalog incomplete: {}", failed.join(", "));
    }
    Ok(((), format!("{} programs seeded", seeded.programs_seeded.len())))
}

fn build_service(
    config: &AppConfig,
    pool: &DbPool,
) -> anyhow::Result<(Arc<GenerationJobService>, String)> {
    let service = GenerationJobService::new(
        ServiceDependencies {
            jobs: Arc::new(SqlJobRepository::new(pool.clone())),
            conversations: Arc::new(SqlConversationRepository::new(pool.clone())),
            catalog: Arc::new(SqlCatalogRepository::new(pool.clone())),
            reasoning: Arc::new(ScriptedReasoningClient::new(demo_script())),
            runtime: Arc::new(RuntimeInit::default()),
        },
        GenerationEngine::with_config(config.worker.engine_config()),
        ServiceSettings::from_config(config),
        WorkerPool::new(1),
    )
    .context("generation service failed to start")?;

    let tools = service.runtime().catalog_check().map(|check| check.tools.len()).unwrap_or(0);
    Ok((Arc::new(service), format!("{tools} tools declared and dispatchable")))
}

async fn scripted_plan_run(service: &GenerationJobService) -> anyhow::Result<((), String)> {
    let (job, _) = service
        .create_or_reuse_job(
            DemoCatalog::USER_ID,
            SMOKE_CONVERSATION,
            json!({ "target_term": "2027-FALL" }),
        )
        .await
        .context("job creation failed")?;

    let outcome = service.run_job_to_step_boundary(&job.id).await.context("driver run failed")?;
    if outcome != RunOutcome::Completed {
        bail!("driver stopped with `{}` instead of completing", outcome.as_str());
    }

    let stored = service
        .get_snapshot(&job.id, &UserId(DemoCatalog::USER_ID.to_string()))
        .await
        .context("snapshot read failed")?
        .context("completed job disappeared")?;
    let credits = stored
        .result_payload
        .as_ref()
        .and_then(|plan| plan.get("totalCredits"))
        .and_then(serde_json::Value::as_u64)
        .context("completed job has no plan credits")?;

    Ok(((), format!("job {} completed with a {credits}-credit plan", stored.id)))
}

/// Walks the certificate program, which has no elective groups, straight to a plan.
fn demo_script() -> Vec<ReasoningReply> {
    let tool = |name: &str, arguments: serde_json::Value| ReasoningReply::ToolCall {
        name: name.to_string(),
        arguments,
    };
    let answer = |value: serde_json::Value| ReasoningReply::Text(value.to_string());

    vec![
        tool("get_student_profile", json!({})),
        answer(json!({ "expected_graduation_term": "2029-SPRING" })),
        tool("list_programs", json!({ "kind": "certificate" })),
        answer(json!({ "program_id": "data-cert", "requires_course_selection": false })),
        answer(json!({ "credits_per_term": 5 })),
        answer(json!({ "milestones": [] })),
        tool(
            "generate_plan",
            json!({
                "terms": [
                    {"term": "2026-FALL", "courses": [{"code": "DATA101", "credits": 5}]},
                    {"term": "2027-SPRING", "courses": [{"code": "DATA201", "credits": 5}]},
                    {"term": "2027-FALL", "courses": [{"code": "DATA301", "credits": 5}]}
                ],
                "notes": "Certificate sequence, one course per term."
            }),
        ),
    ]
}

fn record<T>(
    checks: &mut Vec<SmokeCheck>,
    name: &'static str,
    clock: Instant,
    result: anyhow::Result<(T, String)>,
) -> Option<T> {
    let elapsed_ms = clock.elapsed().as_millis() as u64;
    match result {
        Ok((value, message)) => {
            checks.push(SmokeCheck { name, status: SmokeStatus::Pass, elapsed_ms, message });
            Some(value)
        }
        Err(error) => {
            checks.push(SmokeCheck {
                name,
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: format!("{error:#}"),
            });
            None
        }
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
