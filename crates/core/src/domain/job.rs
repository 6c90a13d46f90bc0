use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::{ConversationId, Step};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    AwaitingInput,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 3] = [Self::Pending, Self::Running, Self::AwaitingInput];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting_input",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "awaiting_input" => Some(Self::AwaitingInput),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Only pending jobs are claimed. A job awaiting input goes back to pending
    /// once the user answers or resolves an approval.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Safe, user-displayable failure description. Never carries reasoning service output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub id: JobId,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub status: JobStatus,
    pub input_payload: Value,
    pub input_fingerprint: String,
    pub result_payload: Option<Value>,
    pub error_info: Option<JobErrorInfo>,
    pub cancel_requested: bool,
    pub current_step: Option<Step>,
    pub progress_percent: u8,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }

    /// Whether the input payload asks for an explicit approval before the plan is generated.
    pub fn requires_approval(&self) -> bool {
        self.input_payload.get("require_approval").and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Field changes applied together with a status compare-and-swap or on their own.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobPatch {
    pub result_payload: Option<Value>,
    pub error_info: Option<JobErrorInfo>,
    pub cancel_requested: Option<bool>,
    pub current_step: Option<Step>,
    pub progress_percent: Option<u8>,
    pub increment_attempt: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies the patch to an in-memory copy; `started_at` only fills an empty slot.
    pub fn apply_to(&self, job: &mut GenerationJob) {
        if let Some(result) = &self.result_payload {
            job.result_payload = Some(result.clone());
        }
        if let Some(error) = &self.error_info {
            job.error_info = Some(error.clone());
        }
        if let Some(flag) = self.cancel_requested {
            job.cancel_requested = flag;
        }
        if let Some(step) = self.current_step {
            job.current_step = Some(step);
        }
        if let Some(percent) = self.progress_percent {
            job.progress_percent = percent;
        }
        if self.increment_attempt {
            job.attempt += 1;
        }
        if job.started_at.is_none() {
            job.started_at = self.started_at;
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    JobCreated,
    JobStarted,
    ClaimReleased,
    StepCompleted,
    ToolInvoked,
    AwaitingInput,
    InputReceived,
    CancelRequested,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "job_created",
            Self::JobStarted => "job_started",
            Self::ClaimReleased => "claim_released",
            Self::StepCompleted => "step_completed",
            Self::ToolInvoked => "tool_invoked",
            Self::AwaitingInput => "awaiting_input",
            Self::InputReceived => "input_received",
            Self::CancelRequested => "cancel_requested",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "job_created" => Some(Self::JobCreated),
            "job_started" => Some(Self::JobStarted),
            "claim_released" => Some(Self::ClaimReleased),
            "step_completed" => Some(Self::StepCompleted),
            "tool_invoked" => Some(Self::ToolInvoked),
            "awaiting_input" => Some(Self::AwaitingInput),
            "input_received" => Some(Self::InputReceived),
            "cancel_requested" => Some(Self::CancelRequested),
            "job_completed" => Some(Self::JobCompleted),
            "job_failed" => Some(Self::JobFailed),
            "job_cancelled" => Some(Self::JobCancelled),
            _ => None,
        }
    }
}

/// Event before the store assigns its sequence id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewJobEvent {
    pub job_id: JobId,
    pub event_type: JobEventType,
    pub step: Option<Step>,
    pub message: Option<String>,
    pub progress_percent: Option<u8>,
    pub payload: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub id: i64,
    pub job_id: JobId,
    pub event_type: JobEventType,
    pub step: Option<Step>,
    pub message: Option<String>,
    pub progress_percent: Option<u8>,
    pub payload: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn from_new(id: i64, event: NewJobEvent) -> Self {
        Self {
            id,
            job_id: event.job_id,
            event_type: event.event_type,
            step: event.step,
            message: event.message,
            progress_percent: event.progress_percent,
            payload: event.payload,
            occurred_at: event.occurred_at,
        }
    }
}
