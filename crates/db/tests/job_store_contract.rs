//! Behaviour every `JobRepository` implementation must share. Each check runs against the
//! SQLite store and the in-memory store.

use chrono::{Duration, Utc};
use serde_json::json;

use gradplan_core::domain::conversation::ConversationId;
use gradplan_core::domain::job::{
    GenerationJob, JobEventType, JobId, JobPatch, JobStatus, NewJobEvent, UserId,
};
use gradplan_db::migrations;
use gradplan_db::repositories::{
    InMemoryJobRepository, InsertOutcome, JobRepository, SqlJobRepository,
};
use gradplan_db::connect_with_settings;

type ContractResult = Result<(), String>;

fn ensure(condition: bool, message: impl Into<String>) -> ContractResult {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

async fn sql_repo() -> SqlJobRepository {
    let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
        .await
        .expect("connect in-memory sqlite");
    migrations::run_pending(&pool).await.expect("run migrations");
    SqlJobRepository::new(pool)
}

fn job(id: &str, user: &str, conversation: &str) -> GenerationJob {
    let now = Utc::now();
    GenerationJob {
        id: JobId(id.to_owned()),
        user_id: UserId(user.to_owned()),
        conversation_id: ConversationId(conversation.to_owned()),
        status: JobStatus::Pending,
        input_payload: json!({"target_term": "2029-SPRING"}),
        input_fingerprint: "fp".to_owned(),
        result_payload: None,
        error_info: None,
        cancel_requested: false,
        current_step: None,
        progress_percent: 0,
        attempt: 0,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    }
}

async fn one_active_job_per_pair(repo: &dyn JobRepository) -> ContractResult {
    let first = job("job-a", "student-1", "conv-1");
    let inserted = repo.insert(first.clone()).await.map_err(|error| error.to_string())?;
    ensure(matches!(inserted, InsertOutcome::Inserted(_)), "first insert should succeed")?;

    let second = repo
        .insert(job("job-b", "student-1", "conv-1"))
        .await
        .map_err(|error| error.to_string())?;
    match second {
        InsertOutcome::ActiveConflict(existing) => {
            ensure(existing.id == first.id, "conflict should report the original job")?
        }
        InsertOutcome::Inserted(_) => return Err("duplicate active job was inserted".to_owned()),
    }

    let other_user = repo
        .insert(job("job-c", "student-2", "conv-1"))
        .await
        .map_err(|error| error.to_string())?;
    ensure(
        matches!(other_user, InsertOutcome::Inserted(_)),
        "the same conversation id under another user is independent",
    )
}

async fn terminal_status_is_immutable(repo: &dyn JobRepository) -> ContractResult {
    let record = job("job-t", "student-1", "conv-t");
    repo.insert(record.clone()).await.map_err(|error| error.to_string())?;

    let cancelled = repo
        .compare_and_swap_status(
            &record.id,
            JobStatus::Pending,
            None,
            JobStatus::Cancelled,
            &JobPatch { completed_at: Some(Utc::now()), ..JobPatch::default() },
        )
        .await
        .map_err(|error| error.to_string())?;
    ensure(cancelled, "pending job should cancel")?;

    for next in [JobStatus::Running, JobStatus::Complete, JobStatus::Pending] {
        let moved = repo
            .compare_and_swap_status(
                &record.id,
                JobStatus::Pending,
                None,
                next,
                &JobPatch::default(),
            )
            .await
            .map_err(|error| error.to_string())?;
        ensure(!moved, format!("terminal job moved to {}", next.as_str()))?;
    }

    let touched = repo
        .update_fields(&record.id, &JobPatch { progress_percent: Some(50), ..JobPatch::default() })
        .await
        .map_err(|error| error.to_string())?;
    ensure(!touched, "terminal job fields should not change")?;

    let stored = repo
        .get(&record.id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or("job should exist")?;
    ensure(stored.status == JobStatus::Cancelled, "status stays cancelled")?;
    ensure(stored.progress_percent == 0, "progress stays untouched")
}

async fn stale_claims_are_listed(repo: &dyn JobRepository) -> ContractResult {
    let record = job("job-s", "student-1", "conv-s");
    repo.insert(record.clone()).await.map_err(|error| error.to_string())?;
    repo.compare_and_swap_status(
        &record.id,
        JobStatus::Pending,
        None,
        JobStatus::Running,
        &JobPatch { increment_attempt: true, ..JobPatch::default() },
    )
    .await
    .map_err(|error| error.to_string())?;

    let stale_before_now = repo
        .list_stale_running(Utc::now() - Duration::seconds(300), 10)
        .await
        .map_err(|error| error.to_string())?;
    ensure(stale_before_now.is_empty(), "a fresh claim is not stale")?;

    let stale_later = repo
        .list_stale_running(Utc::now() + Duration::seconds(301), 10)
        .await
        .map_err(|error| error.to_string())?;
    ensure(stale_later.len() == 1, "claim older than the threshold is stale")
}

async fn superseded_claim_cannot_move_the_job(repo: &dyn JobRepository) -> ContractResult {
    let record = job("job-r", "student-1", "conv-r");
    repo.insert(record.clone()).await.map_err(|error| error.to_string())?;
    let claim = JobPatch { increment_attempt: true, ..JobPatch::default() };

    let swap = |expected: JobStatus, attempt: Option<u32>, next: JobStatus, patch: JobPatch| {
        let id = record.id.clone();
        async move {
            repo.compare_and_swap_status(&id, expected, attempt, next, &patch)
                .await
                .map_err(|error| error.to_string())
        }
    };

    ensure(swap(JobStatus::Pending, Some(0), JobStatus::Running, claim.clone()).await?, "claim")?;
    ensure(
        swap(JobStatus::Running, Some(1), JobStatus::Pending, JobPatch::default()).await?,
        "release of attempt 1",
    )?;
    ensure(swap(JobStatus::Pending, Some(1), JobStatus::Running, claim).await?, "reclaim")?;

    let stale = swap(JobStatus::Running, Some(1), JobStatus::AwaitingInput, JobPatch::default());
    ensure(!stale.await?, "attempt 1 no longer owns the job")?;
    ensure(
        swap(JobStatus::Running, Some(2), JobStatus::AwaitingInput, JobPatch::default()).await?,
        "attempt 2 owns the job",
    )?;

    let stored = repo
        .get(&record.id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or("job should exist")?;
    ensure(stored.attempt == 2, "two claims were taken")?;
    ensure(stored.status == JobStatus::AwaitingInput, "only the current claim moved the job")
}

async fn events_page_with_cursor(repo: &dyn JobRepository) -> ContractResult {
    let record = job("job-e", "student-1", "conv-e");
    repo.insert(record.clone()).await.map_err(|error| error.to_string())?;

    let mut ids = Vec::new();
    for event_type in
        [JobEventType::JobCreated, JobEventType::JobStarted, JobEventType::StepCompleted]
    {
        let stored = repo
            .append_event(NewJobEvent {
                job_id: record.id.clone(),
                event_type,
                step: None,
                message: None,
                progress_percent: None,
                payload: None,
                occurred_at: Utc::now(),
            })
            .await
            .map_err(|error| error.to_string())?;
        ids.push(stored.id);
    }
    ensure(ids.windows(2).all(|pair| pair[0] < pair[1]), "event ids are monotonic")?;

    let page = repo.list_events(&record.id, Some(ids[0]), 1).await.map_err(|e| e.to_string())?;
    ensure(page.len() == 1, "limit bounds the page")?;
    ensure(page[0].event_type == JobEventType::JobStarted, "page starts after the cursor")
}

#[tokio::test]
async fn sqlite_store_honours_job_contract() -> ContractResult {
    one_active_job_per_pair(&sql_repo().await).await?;
    terminal_status_is_immutable(&sql_repo().await).await?;
    stale_claims_are_listed(&sql_repo().await).await?;
    superseded_claim_cannot_move_the_job(&sql_repo().await).await?;
    events_page_with_cursor(&sql_repo().await).await
}

#[tokio::test]
async fn in_memory_store_honours_job_contract() -> ContractResult {
    one_active_job_per_pair(&InMemoryJobRepository::default()).await?;
    terminal_status_is_immutable(&InMemoryJobRepository::default()).await?;
    stale_claims_are_listed(&InMemoryJobRepository::default()).await?;
    superseded_claim_cannot_move_the_job(&InMemoryJobRepository::default()).await?;
    events_page_with_cursor(&InMemoryJobRepository::default()).await
}
