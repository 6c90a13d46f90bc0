//! Generation job lifecycle rules
//!
//! Pure decisions for the generation job state machine: what a new job looks
//! like, which status edges are legal, what each transition writes, how long to
//! back off between reasoning attempts, and which running claims are stale.
//! The orchestrator applies the resulting [`JobTransition`]s through the job
//! store's compare-and-swap.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::conversation::{ConversationId, Step};
use crate::domain::job::{
    GenerationJob, JobErrorInfo, JobEventType, JobId, JobPatch, JobStatus, NewJobEvent, UserId,
};

const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationEngineConfig {
    /// How long a running job may go without an update before it is reclaimed
    pub claim_timeout_seconds: i64,
    /// Attempts per reasoning request, including the first
    pub max_reasoning_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
    pub retry_max_delay_ms: u64,
    /// Tool failures tolerated within one step before the job fails
    pub max_tool_failures_per_step: u32,
    /// Reasoning turns allowed within one step of one driver run
    pub max_turns_per_step: u32,
}

impl Default for GenerationEngineConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 300,
            max_reasoning_attempts: 3,
            retry_base_delay_ms: 250,
            retry_backoff_multiplier: 2,
            retry_max_delay_ms: 5_000,
            max_tool_failures_per_step: 3,
            max_turns_per_step: 24,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("invalid job request: {0}")]
    Validation(String),
}

/// Stable failure codes persisted in `errorInfo`. Messages are fixed and safe to show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCode {
    ReasoningUnavailable,
    ToolFailureBudgetExceeded,
    TurnLimitExceeded,
    InvariantViolation,
    PersistenceFailure,
    ApprovalRejected,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReasoningUnavailable => "reasoning_unavailable",
            Self::ToolFailureBudgetExceeded => "tool_failures",
            Self::TurnLimitExceeded => "turn_limit_exceeded",
            Self::InvariantViolation => "invariant_violation",
            Self::PersistenceFailure => "persistence_failure",
            Self::ApprovalRejected => "approval_rejected",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ReasoningUnavailable => {
                "The planning assistant is unavailable right now. Please try again later."
            }
            Self::ToolFailureBudgetExceeded => {
                "Student or program data could not be retrieved for this plan."
            }
            Self::TurnLimitExceeded => "The plan conversation did not converge on an answer.",
            Self::InvariantViolation => "The plan conversation reached an inconsistent state.",
            Self::PersistenceFailure => "Plan progress could not be saved.",
            Self::ApprovalRejected => "The plan was not approved for generation.",
        }
    }

    pub fn error_info(&self) -> JobErrorInfo {
        JobErrorInfo { code: self.as_str().to_string(), message: self.user_message().to_string() }
    }
}

/// A status compare-and-swap plus the fields and event that go with it.
///
/// `expected_attempt` pins the swap to the claim it was built from, so a driver whose
/// claim was released and taken over cannot move the job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobTransition {
    pub job_id: JobId,
    pub expected: JobStatus,
    pub expected_attempt: u32,
    pub next: JobStatus,
    pub patch: JobPatch,
    pub event: NewJobEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(std::time::Duration),
    GiveUp,
}

#[derive(Clone, Debug, Default)]
pub struct GenerationEngine {
    config: GenerationEngineConfig,
}

impl GenerationEngine {
    pub fn new() -> Self {
        Self::with_config(GenerationEngineConfig::default())
    }

    pub fn with_config(config: GenerationEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GenerationEngineConfig {
        &self.config
    }

    /// Builds a pending job after validating the caller-supplied identity and payload.
    pub fn create_job(
        &self,
        user_id: &str,
        conversation_id: &str,
        input_payload: Value,
    ) -> Result<(GenerationJob, NewJobEvent), GenerationError> {
        let user_id = validate_identifier("userId", user_id)?;
        let conversation_id = validate_identifier("conversationId", conversation_id)?;
        if !input_payload.is_object() {
            return Err(GenerationError::Validation(
                "inputPayload must be a JSON object".to_string(),
            ));
        }

        let now = Utc::now();
        let job = GenerationJob {
            id: JobId(Uuid::new_v4().to_string()),
            user_id: UserId(user_id),
            conversation_id: ConversationId(conversation_id),
            status: JobStatus::Pending,
            input_fingerprint: Self::fingerprint(&input_payload),
            input_payload,
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
        };
        let event = event(&job.id, JobEventType::JobCreated, now)
            .with_payload(json!({ "conversationId": job.conversation_id.0 }));

        Ok((job, event))
    }

    /// pending -> running
    pub fn claim(&self, job: &GenerationJob) -> Result<JobTransition, GenerationError> {
        if !job.status.is_claimable() {
            return Err(GenerationError::InvalidTransition {
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let now = Utc::now();
        Ok(JobTransition {
            job_id: job.id.clone(),
            expected: job.status,
            expected_attempt: job.attempt,
            next: JobStatus::Running,
            patch: JobPatch {
                increment_attempt: true,
                started_at: Some(now),
                ..JobPatch::default()
            },
            event: event(&job.id, JobEventType::JobStarted, now)
                .with_payload(json!({ "attempt": job.attempt + 1 })),
        })
    }

    /// running -> awaiting_input, recording where the conversation stopped.
    pub fn await_input(
        &self,
        job: &GenerationJob,
        step: Step,
        progress_percent: u8,
        reason: &str,
    ) -> Result<JobTransition, GenerationError> {
        self.validate_transition(job.status, JobStatus::AwaitingInput)?;
        let now = Utc::now();
        Ok(JobTransition {
            job_id: job.id.clone(),
            expected: job.status,
            expected_attempt: job.attempt,
            next: JobStatus::AwaitingInput,
            patch: JobPatch {
                current_step: Some(step),
                progress_percent: Some(progress_percent),
                ..JobPatch::default()
            },
            event: event(&job.id, JobEventType::AwaitingInput, now)
                .with_step(step)
                .with_progress(progress_percent)
                .with_message(reason),
        })
    }

    /// awaiting_input -> pending after the user responded.
    pub fn resume(&self, job: &GenerationJob) -> Result<JobTransition, GenerationError> {
        self.validate_transition(job.status, JobStatus::Pending)?;
        let now = Utc::now();
        Ok(JobTransition {
            job_id: job.id.clone(),
            expected: job.status,
            expected_attempt: job.attempt,
            next: JobStatus::Pending,
            patch: JobPatch::default(),
            event: event(&job.id, JobEventType::InputReceived, now),
        })
    }

    /// running -> complete with the finished plan.
    pub fn complete(
        &self,
        job: &GenerationJob,
        plan: Value,
    ) -> Result<JobTransition, GenerationError> {
        self.validate_transition(job.status, JobStatus::Complete)?;
        let now = Utc::now();
        Ok(JobTransition {
            job_id: job.id.clone(),
            expected: job.status,
            expected_attempt: job.attempt,
            next: JobStatus::Complete,
            patch: JobPatch {
                result_payload: Some(plan),
                current_step: Some(Step::GeneratingPlan),
                progress_percent: Some(100),
                completed_at: Some(now),
                ..JobPatch::default()
            },
            event: event(&job.id, JobEventType::JobCompleted, now)
                .with_step(Step::GeneratingPlan)
                .with_progress(100),
        })
    }

    /// Non-terminal -> failed with a safe error description.
    pub fn fail(
        &self,
        job: &GenerationJob,
        code: FailureCode,
    ) -> Result<JobTransition, GenerationError> {
        self.validate_transition(job.status, JobStatus::Failed)?;
        let now = Utc::now();
        let error_info = code.error_info();
        Ok(JobTransition {
            job_id: job.id.clone(),
            expected: job.status,
            expected_attempt: job.attempt,
            next: JobStatus::Failed,
            patch: JobPatch {
                error_info: Some(error_info.clone()),
                completed_at: Some(now),
                ..JobPatch::default()
            },
            event: event(&job.id, JobEventType::JobFailed, now)
                .with_message(error_info.message)
                .with_payload(json!({ "code": error_info.code })),
        })
    }

    /// Non-terminal -> cancelled. Only valid once cancellation was requested.
    pub fn cancel(&self, job: &GenerationJob) -> Result<JobTransition, GenerationError> {
        self.validate_transition(job.status, JobStatus::Cancelled)?;
        if !job.cancel_requested {
            return Err(GenerationError::InvalidTransition {
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }
        let now = Utc::now();
        Ok(JobTransition {
            job_id: job.id.clone(),
            expected: job.status,
            expected_attempt: job.attempt,
            next: JobStatus::Cancelled,
            patch: JobPatch { completed_at: Some(now), ..JobPatch::default() },
            event: event(&job.id, JobEventType::JobCancelled, now)
                .with_payload(json!({ "observedIn": job.status.as_str() })),
        })
    }

    /// Running claim whose owner stopped making progress -> back to pending.
    pub fn release_stale(&self, job: &GenerationJob) -> Result<JobTransition, GenerationError> {
        self.validate_transition(job.status, JobStatus::Pending)?;
        let now = Utc::now();
        Ok(JobTransition {
            job_id: job.id.clone(),
            expected: job.status,
            expected_attempt: job.attempt,
            next: JobStatus::Pending,
            patch: JobPatch::default(),
            event: event(&job.id, JobEventType::ClaimReleased, now)
                .with_payload(json!({ "attempt": job.attempt })),
        })
    }

    /// Exponential backoff after `failed_attempts` reasoning failures.
    pub fn reasoning_retry(&self, failed_attempts: u32) -> RetryDecision {
        if failed_attempts >= self.config.max_reasoning_attempts {
            return RetryDecision::GiveUp;
        }
        let exponent = failed_attempts.saturating_sub(1);
        let factor = u64::from(self.config.retry_backoff_multiplier).saturating_pow(exponent);
        let delay_ms = self
            .config
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.config.retry_max_delay_ms);
        RetryDecision::RetryAfter(std::time::Duration::from_millis(delay_ms))
    }

    /// Running jobs not touched since the claim timeout.
    pub fn stale_threshold(&self, reference_time: DateTime<Utc>) -> DateTime<Utc> {
        reference_time - Duration::seconds(self.config.claim_timeout_seconds)
    }

    pub fn validate_transition(
        &self,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<(), GenerationError> {
        use JobStatus::{AwaitingInput, Cancelled, Complete, Failed, Pending, Running};

        let valid = match (from, to) {
            (Pending, Running) => true,
            (Running, AwaitingInput | Complete | Failed | Cancelled | Pending) => true,
            (AwaitingInput, Pending | Failed | Cancelled) => true,
            (Pending, Cancelled | Failed) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(GenerationError::InvalidTransition { from, to })
        }
    }

    /// SHA-256 of the canonical JSON encoding (object keys are sorted).
    pub fn fingerprint(payload: &Value) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<String, GenerationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::Validation(format!("{field} is required")));
    }
    if trimmed.len() > MAX_ID_LEN {
        return Err(GenerationError::Validation(format!(
            "{field} must be at most {MAX_ID_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn event(job_id: &JobId, event_type: JobEventType, occurred_at: DateTime<Utc>) -> NewJobEvent {
    NewJobEvent {
        job_id: job_id.clone(),
        event_type,
        step: None,
        message: None,
        progress_percent: None,
        payload: None,
        occurred_at,
    }
}

impl NewJobEvent {
    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress_percent: u8) -> Self {
        self.progress_percent = Some(progress_percent);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
