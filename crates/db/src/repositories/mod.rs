use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use gradplan_core::domain::catalog::{
    CourseOffering, Program, ProgramId, ProgramKind, ProgramRequirements, RequirementGroup,
    StudentProfile,
};
use gradplan_core::domain::conversation::{ConversationId, ConversationState};
use gradplan_core::domain::job::{
    GenerationJob, JobEvent, JobId, JobPatch, JobStatus, NewJobEvent, UserId,
};

pub mod catalog;
pub mod conversation;
pub mod generation_job;
pub mod memory;

pub use catalog::SqlCatalogRepository;
pub use conversation::SqlConversationRepository;
pub use generation_job::SqlJobRepository;
pub use memory::{InMemoryCatalogRepository, InMemoryConversationRepository, InMemoryJobRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(error: serde_json::Error) -> Self {
        Self::Decode(error.to_string())
    }
}

/// Result of inserting a job under the one-active-job-per-conversation rule.
#[derive(Clone, Debug, PartialEq)]
pub enum InsertOutcome {
    Inserted(GenerationJob),
    /// Another non-terminal job already exists for the same user and conversation.
    ActiveConflict(GenerationJob),
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find_active(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Option<GenerationJob>, RepositoryError>;

    async fn insert(&self, job: GenerationJob) -> Result<InsertOutcome, RepositoryError>;

    async fn get(&self, id: &JobId) -> Result<Option<GenerationJob>, RepositoryError>;

    /// Moves `id` from `expected` to `next` and applies `patch` in one atomic step.
    /// Returns false when the stored status no longer equals `expected`, or when
    /// `expected_attempt` is given and the stored attempt differs.
    async fn compare_and_swap_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        expected_attempt: Option<u32>,
        next: JobStatus,
        patch: &JobPatch,
    ) -> Result<bool, RepositoryError>;

    /// Applies `patch` without touching status. Terminal jobs are left alone.
    async fn update_fields(&self, id: &JobId, patch: &JobPatch) -> Result<bool, RepositoryError>;

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<GenerationJob>, RepositoryError>;

    async fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<GenerationJob>, RepositoryError>;

    async fn append_event(&self, event: NewJobEvent) -> Result<JobEvent, RepositoryError>;

    async fn list_events(
        &self,
        job_id: &JobId,
        after_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<JobEvent>, RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn load(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError>;

    async fn save(&self, user_id: &UserId, state: ConversationState)
        -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn student_profile(
        &self,
        user_id: &UserId,
    ) -> Result<Option<StudentProfile>, RepositoryError>;

    async fn list_programs(
        &self,
        kind: Option<ProgramKind>,
    ) -> Result<Vec<Program>, RepositoryError>;

    async fn program_requirements(
        &self,
        program_id: &ProgramId,
    ) -> Result<Option<ProgramRequirements>, RepositoryError>;

    async fn course_offerings(
        &self,
        codes: &[String],
        term: Option<&str>,
    ) -> Result<Vec<CourseOffering>, RepositoryError>;

    async fn save_profile(&self, profile: StudentProfile) -> Result<(), RepositoryError>;

    async fn save_program(
        &self,
        program: Program,
        groups: Vec<RequirementGroup>,
    ) -> Result<(), RepositoryError>;

    async fn save_offering(&self, offering: CourseOffering) -> Result<(), RepositoryError>;
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_percent(column: &str, value: i64) -> Result<u8, RepositoryError> {
    u8::try_from(value).ok().filter(|percent| *percent <= 100).ok_or_else(|| {
        RepositoryError::Decode(format!("invalid percentage in `{column}`: {value}"))
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

/// Fixed-width UTC text so stored timestamps compare correctly as strings.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// SQLite binds integers as i64; limits coming from callers are u32.
pub(crate) fn limit_param(limit: u32) -> i64 {
    i64::from(limit)
}
