use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use gradplan_core::domain::conversation::{ConversationId, Step};
use gradplan_core::domain::job::{
    GenerationJob, JobErrorInfo, JobEvent, JobEventType, JobId, JobPatch, JobStatus, NewJobEvent,
    UserId,
};

use super::{
    format_timestamp, limit_param, parse_optional_timestamp, parse_percent, parse_timestamp,
    parse_u32, InsertOutcome, JobRepository, RepositoryError,
};
use crate::DbPool;

const JOB_COLUMNS: &str = "id,
    user_id,
    conversation_id,
    status,
    input_payload_json,
    input_fingerprint,
    result_payload_json,
    error_code,
    error_message,
    cancel_requested,
    current_step,
    progress_percent,
    attempt,
    created_at,
    updated_at,
    started_at,
    completed_at";

// Shared by compare-and-swap and plain field updates. Bind order is fixed by `bind_patch`.
const PATCH_ASSIGNMENTS: &str = "result_payload_json = COALESCE(?, result_payload_json),
    error_code = COALESCE(?, error_code),
    error_message = COALESCE(?, error_message),
    cancel_requested = COALESCE(?, cancel_requested),
    current_step = COALESCE(?, current_step),
    progress_percent = COALESCE(?, progress_percent),
    attempt = attempt + ?,
    started_at = COALESCE(started_at, ?),
    completed_at = COALESCE(?, completed_at),
    updated_at = ?";

const INSERT_ATTEMPTS: usize = 3;

pub struct SqlJobRepository {
    pool: DbPool,
}

impl SqlJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn try_insert(&self, job: &GenerationJob) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "INSERT INTO generation_job ({JOB_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&job.id.0)
        .bind(&job.user_id.0)
        .bind(&job.conversation_id.0)
        .bind(job.status.as_str())
        .bind(job.input_payload.to_string())
        .bind(&job.input_fingerprint)
        .bind(job.result_payload.as_ref().map(Value::to_string))
        .bind(job.error_info.as_ref().map(|error| error.code.clone()))
        .bind(job.error_info.as_ref().map(|error| error.message.clone()))
        .bind(i64::from(job.cancel_requested))
        .bind(job.current_step.map(|step| step.as_str()))
        .bind(i64::from(job.progress_percent))
        .bind(i64::from(job.attempt))
        .bind(format_timestamp(job.created_at))
        .bind(format_timestamp(job.updated_at))
        .bind(job.started_at.map(format_timestamp))
        .bind(job.completed_at.map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl JobRepository for SqlJobRepository {
    async fn find_active(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Option<GenerationJob>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM generation_job
             WHERE user_id = ?
               AND conversation_id = ?
               AND status IN ('pending', 'running', 'awaiting_input')
             LIMIT 1"
        ))
        .bind(&user_id.0)
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn insert(&self, job: GenerationJob) -> Result<InsertOutcome, RepositoryError> {
        for _ in 0..INSERT_ATTEMPTS {
            match self.try_insert(&job).await {
                Ok(()) => return Ok(InsertOutcome::Inserted(job)),
                Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                    // The competing job may have gone terminal between the insert and this read.
                    if let Some(existing) =
                        self.find_active(&job.user_id, &job.conversation_id).await?
                    {
                        return Ok(InsertOutcome::ActiveConflict(existing));
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(RepositoryError::Decode(format!(
            "active job for `{}` unresolved after {INSERT_ATTEMPTS} attempts",
            job.conversation_id
        )))
    }

    async fn get(&self, id: &JobId) -> Result<Option<GenerationJob>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM generation_job WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(job_from_row).transpose()
    }

    async fn compare_and_swap_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        expected_attempt: Option<u32>,
        next: JobStatus,
        patch: &JobPatch,
    ) -> Result<bool, RepositoryError> {
        let sql = format!(
            "UPDATE generation_job
             SET status = ?, {PATCH_ASSIGNMENTS}
             WHERE id = ? AND status = ? AND (? IS NULL OR attempt = ?)"
        );
        let attempt = expected_attempt.map(i64::from);
        let query = sqlx::query(&sql).bind(next.as_str());
        let result = bind_patch(query, patch, Utc::now())
            .bind(&id.0)
            .bind(expected.as_str())
            .bind(attempt)
            .bind(attempt)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_fields(&self, id: &JobId, patch: &JobPatch) -> Result<bool, RepositoryError> {
        let sql = format!(
            "UPDATE generation_job
             SET {PATCH_ASSIGNMENTS}
             WHERE id = ? AND status IN ('pending', 'running', 'awaiting_input')"
        );
        let result = bind_patch(sqlx::query(&sql), patch, Utc::now())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<GenerationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM generation_job
             WHERE status = ?
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<GenerationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM generation_job
             WHERE status = 'running' AND updated_at < ?
             ORDER BY updated_at ASC
             LIMIT ?"
        ))
        .bind(format_timestamp(updated_before))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn append_event(&self, event: NewJobEvent) -> Result<JobEvent, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO generation_job_event (
                job_id,
                event_type,
                step,
                message,
                progress_percent,
                payload_json,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.job_id.0)
        .bind(event.event_type.as_str())
        .bind(event.step.map(|step| step.as_str()))
        .bind(event.message.as_deref())
        .bind(event.progress_percent.map(i64::from))
        .bind(event.payload.as_ref().map(Value::to_string))
        .bind(format_timestamp(event.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(JobEvent::from_new(result.last_insert_rowid(), event))
    }

    async fn list_events(
        &self,
        job_id: &JobId,
        after_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<JobEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                job_id,
                event_type,
                step,
                message,
                progress_percent,
                payload_json,
                occurred_at
             FROM generation_job_event
             WHERE job_id = ? AND id > ?
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(&job_id.0)
        .bind(after_id.unwrap_or(0))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

fn bind_patch<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    patch: &JobPatch,
    now: DateTime<Utc>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(patch.result_payload.as_ref().map(Value::to_string))
        .bind(patch.error_info.as_ref().map(|error| error.code.clone()))
        .bind(patch.error_info.as_ref().map(|error| error.message.clone()))
        .bind(patch.cancel_requested.map(i64::from))
        .bind(patch.current_step.map(|step| step.as_str()))
        .bind(patch.progress_percent.map(i64::from))
        .bind(i64::from(patch.increment_attempt))
        .bind(patch.started_at.map(format_timestamp))
        .bind(patch.completed_at.map(format_timestamp))
        .bind(format_timestamp(now))
}

fn job_from_row(row: SqliteRow) -> Result<GenerationJob, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job status `{status_raw}`")))?;

    let input_payload = serde_json::from_str(&row.try_get::<String, _>("input_payload_json")?)?;
    let result_payload = row
        .try_get::<Option<String>, _>("result_payload_json")?
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()?;

    let error_info = match (
        row.try_get::<Option<String>, _>("error_code")?,
        row.try_get::<Option<String>, _>("error_message")?,
    ) {
        (Some(code), Some(message)) => Some(JobErrorInfo { code, message }),
        (Some(code), None) => Some(JobErrorInfo { code, message: String::new() }),
        _ => None,
    };

    Ok(GenerationJob {
        id: JobId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        status,
        input_payload,
        input_fingerprint: row.try_get("input_fingerprint")?,
        result_payload,
        error_info,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        current_step: parse_optional_step(row.try_get("current_step")?)?,
        progress_percent: parse_percent("progress_percent", row.try_get("progress_percent")?)?,
        attempt: parse_u32("attempt", row.try_get("attempt")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

fn event_from_row(row: SqliteRow) -> Result<JobEvent, RepositoryError> {
    let type_raw = row.try_get::<String, _>("event_type")?;
    let event_type = JobEventType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job event type `{type_raw}`")))?;

    Ok(JobEvent {
        id: row.try_get("id")?,
        job_id: JobId(row.try_get("job_id")?),
        event_type,
        step: parse_optional_step(row.try_get("step")?)?,
        message: row.try_get("message")?,
        progress_percent: row
            .try_get::<Option<i64>, _>("progress_percent")?
            .map(|value| parse_percent("progress_percent", value))
            .transpose()?,
        payload: row
            .try_get::<Option<String>, _>("payload_json")?
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

pub(crate) fn parse_optional_step(value: Option<String>) -> Result<Option<Step>, RepositoryError> {
    value
        .map(|raw| {
            Step::parse(&raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown conversation step `{raw}`"))
            })
        })
        .transpose()
}
