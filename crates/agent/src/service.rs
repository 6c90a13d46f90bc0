//! Generation job orchestration.
//!
//! [`GenerationJobService`] owns the job lifecycle: idempotent creation, the
//! driver that advances a claimed job's conversation to the next boundary, and
//! the caller-facing controls (cancel, snapshot, input, approval, events).
//! Every status change goes through a [`JobTransition`] built by the engine and
//! applied as a compare-and-swap, so only the driver holding the claim writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use gradplan_core::config::AppConfig;
use gradplan_core::domain::conversation::{
    AgentStatus, ConversationMessage, ConversationState, Step,
};
use gradplan_core::domain::job::{
    GenerationJob, JobEvent, JobEventType, JobId, JobPatch, JobStatus, UserId,
};
use gradplan_core::domain::tool::{ToolCall, ToolResult};
use gradplan_core::errors::{ApplicationError, DomainError, InterfaceError};
use gradplan_core::flows::{ConversationFlow, FlowTransitionError};
use gradplan_core::generation_engine::{
    event, FailureCode, GenerationEngine, GenerationError, JobTransition, RetryDecision,
};
use gradplan_db::repositories::{
    CatalogRepository, ConversationRepository, InsertOutcome, JobRepository, RepositoryError,
};

use crate::dispatch::{ToolContext, ToolDispatcher, ToolExecutionError};
use crate::llm::{ReasoningClient, ReasoningError, ReasoningReply, ReasoningRequest};
use crate::prompt::system_prompt;
use crate::runtime::RuntimeInit;
use crate::tools::{ToolRegistry, GENERATE_PLAN};
use crate::worker::WorkerPool;

const DEFAULT_EVENT_LIMIT: u32 = 50;
const MAX_EVENT_LIMIT: u32 = 200;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("generation job not found: {0}")]
    NotFound(JobId),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("runtime initialization failed: {0}")]
    Runtime(String),
}

impl ServiceError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        match self {
            Self::Unauthorized(message) => {
                InterfaceError::Unauthorized { message, correlation_id: correlation_id.into() }
            }
            other => ApplicationError::from(other).into_interface(correlation_id),
        }
    }
}

impl From<ServiceError> for ApplicationError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::Validation(message) => {
                Self::Domain(DomainError::JobTransition(GenerationError::Validation(message)))
            }
            ServiceError::NotFound(id) => Self::NotFound { entity: "generation job", id: id.0 },
            ServiceError::Unauthorized(message) => {
                Self::Forbidden { entity: "internal endpoint", id: message }
            }
            ServiceError::Conflict(message) => Self::Conflict(message),
            ServiceError::Repository(error) => Self::Persistence(error.to_string()),
            ServiceError::Runtime(message) => Self::Configuration(message),
        }
    }
}

impl From<GenerationError> for ServiceError {
    fn from(value: GenerationError) -> Self {
        match value {
            GenerationError::Validation(message) => Self::Validation(message),
            transition @ GenerationError::InvalidTransition { .. } => {
                Self::Conflict(transition.to_string())
            }
        }
    }
}

impl From<FlowTransitionError> for ServiceError {
    fn from(value: FlowTransitionError) -> Self {
        Self::Conflict(value.to_string())
    }
}

/// Where a driver run stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing to do: the job is missing, terminal, owned by another driver or not claimable.
    Skipped { reason: &'static str },
    Cancelled,
    AwaitingInput { step: Step },
    AwaitingApproval,
    Completed,
    Failed { code: FailureCode },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Cancelled => "cancelled",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSettings {
    pub reasoning_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { reasoning_timeout: Duration::from_secs(60), tool_timeout: Duration::from_secs(15) }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            reasoning_timeout: Duration::from_secs(config.llm.timeout_secs),
            tool_timeout: Duration::from_secs(config.worker.tool_timeout_secs),
        }
    }
}

/// Collaborators the service is built from.
pub struct ServiceDependencies {
    pub jobs: Arc<dyn JobRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub reasoning: Arc<dyn ReasoningClient>,
    pub runtime: Arc<RuntimeInit>,
}

/// Fatal condition inside a driver run. `detail` is for logs only.
#[derive(Debug)]
struct DriverFailure {
    code: FailureCode,
    detail: String,
}

impl DriverFailure {
    fn new(code: FailureCode, detail: impl Into<String>) -> Self {
        Self { code, detail: detail.into() }
    }
}

impl From<RepositoryError> for DriverFailure {
    fn from(value: RepositoryError) -> Self {
        Self::new(FailureCode::PersistenceFailure, value.to_string())
    }
}

impl From<FlowTransitionError> for DriverFailure {
    fn from(value: FlowTransitionError) -> Self {
        Self::new(FailureCode::InvariantViolation, value.to_string())
    }
}

impl From<GenerationError> for DriverFailure {
    fn from(value: GenerationError) -> Self {
        Self::new(FailureCode::InvariantViolation, value.to_string())
    }
}

/// Conversation handed to a freshly claimed driver.
enum Prepared {
    Ready(ConversationState),
    /// Left at the approval gate by an earlier job; only `resolve_approval` may lift it.
    AtApprovalGate(ConversationState),
}

/// Per-step counters for one driver run.
#[derive(Debug)]
struct StepBudget {
    step: Step,
    turns: u32,
    tool_failures: u32,
}

impl StepBudget {
    fn new(step: Step) -> Self {
        Self { step, turns: 0, tool_failures: 0 }
    }

    fn observe(&mut self, step: Step) {
        if step != self.step {
            *self = Self::new(step);
        }
    }
}

pub struct GenerationJobService {
    jobs: Arc<dyn JobRepository>,
    conversations: Arc<dyn ConversationRepository>,
    reasoning: Arc<dyn ReasoningClient>,
    registry: ToolRegistry,
    dispatcher: ToolDispatcher,
    engine: GenerationEngine,
    flow: ConversationFlow,
    settings: ServiceSettings,
    runtime: Arc<RuntimeInit>,
    pool: WorkerPool,
}

impl GenerationJobService {
    pub fn new(
        dependencies: ServiceDependencies,
        engine: GenerationEngine,
        settings: ServiceSettings,
        pool: WorkerPool,
    ) -> Result<Self, ServiceError> {
        let registry = ToolRegistry::builtin();
        let dispatcher = ToolDispatcher::with_catalog_handlers(dependencies.catalog);
        dependencies
            .runtime
            .ensure_catalog(&registry, &dispatcher)
            .map_err(|error| ServiceError::Runtime(error.to_string()))?;

        Ok(Self {
            jobs: dependencies.jobs,
            conversations: dependencies.conversations,
            reasoning: dependencies.reasoning,
            registry,
            dispatcher,
            engine,
            flow: ConversationFlow::default(),
            settings,
            runtime: dependencies.runtime,
            pool,
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn runtime(&self) -> &RuntimeInit {
        &self.runtime
    }

    pub fn flow(&self) -> &ConversationFlow {
        &self.flow
    }

    pub async fn create_or_reuse_job(
        &self,
        user_id: &str,
        conversation_id: &str,
        input_payload: Value,
    ) -> Result<(GenerationJob, bool), ServiceError> {
        let (job, created) = self.engine.create_job(user_id, conversation_id, input_payload)?;
        let fingerprint = job.input_fingerprint.clone();

        if let Some(existing) = self.jobs.find_active(&job.user_id, &job.conversation_id).await? {
            log_reuse(&existing, &fingerprint);
            return Ok((existing, true));
        }

        match self.jobs.insert(job).await? {
            InsertOutcome::Inserted(job) => {
                self.jobs.append_event(created).await?;
                info!(
                    event_name = "generation.job.created",
                    job_id = %job.id,
                    user_id = %job.user_id,
                    conversation_id = %job.conversation_id,
                    "generation job created"
                );
                Ok((job, false))
            }
            InsertOutcome::ActiveConflict(existing) => {
                log_reuse(&existing, &fingerprint);
                Ok((existing, true))
            }
        }
    }

    /// Hands the job to the worker pool and returns immediately.
    pub fn trigger_job(self: &Arc<Self>, job_id: JobId) {
        let service = Arc::clone(self);
        let task_job_id = job_id.clone();
        self.pool.spawn(&job_id, async move {
            match service.run_job_to_step_boundary(&task_job_id).await {
                Ok(outcome) => debug!(
                    event_name = "generation.job.trigger_finished",
                    job_id = %task_job_id,
                    outcome = outcome.as_str(),
                    "triggered run finished"
                ),
                Err(error) => error!(
                    event_name = "generation.job.trigger_failed",
                    job_id = %task_job_id,
                    error = %error,
                    "triggered run failed"
                ),
            }
        });
    }

    pub async fn run_job_to_step_boundary(
        &self,
        job_id: &JobId,
    ) -> Result<RunOutcome, ServiceError> {
        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(RunOutcome::Skipped { reason: "missing" });
        };
        if job.status.is_terminal() {
            return Ok(RunOutcome::Skipped { reason: "terminal" });
        }
        if job.status == JobStatus::Running {
            return Ok(RunOutcome::Skipped { reason: "already_running" });
        }
        if job.cancel_requested {
            return self.cancel_unclaimed(&job).await;
        }
        if !job.status.is_claimable() {
            return Ok(RunOutcome::Skipped { reason: "awaiting_input" });
        }

        let claim = self.engine.claim(&job)?;
        if !self.apply(&claim).await? {
            return Ok(RunOutcome::Skipped { reason: "claim_lost" });
        }
        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(RunOutcome::Skipped { reason: "missing" });
        };
        info!(
            event_name = "generation.job.claimed",
            job_id = %job.id,
            attempt = job.attempt,
            "generation job claimed"
        );

        let attempt = job.attempt;
        match self.drive(job).await {
            Ok(outcome) => Ok(outcome),
            Err(failure) => self.fail_job(job_id, attempt, failure).await,
        }
    }

    pub async fn request_cancel(
        &self,
        job_id: &JobId,
        user_id: &UserId,
    ) -> Result<Option<GenerationJob>, ServiceError> {
        let Some(job) = self.owned_job(job_id, user_id).await? else {
            return Ok(None);
        };
        if job.status.is_terminal() || job.cancel_requested {
            return Ok(Some(job));
        }

        let patch = JobPatch { cancel_requested: Some(true), ..JobPatch::default() };
        if self.jobs.update_fields(&job.id, &patch).await? {
            self.jobs
                .append_event(
                    event(&job.id, JobEventType::CancelRequested, Utc::now())
                        .with_payload(json!({ "observedStatus": job.status.as_str() })),
                )
                .await?;
            info!(
                event_name = "generation.job.cancel_requested",
                job_id = %job.id,
                status = job.status.as_str(),
                "cancellation requested"
            );
        }

        Ok(self.jobs.get(job_id).await?)
    }

    pub async fn get_snapshot(
        &self,
        job_id: &JobId,
        user_id: &UserId,
    ) -> Result<Option<GenerationJob>, ServiceError> {
        self.owned_job(job_id, user_id).await
    }

    /// Adds the student's reply to a paused conversation and puts the job back in line.
    pub async fn submit_input(
        self: &Arc<Self>,
        job_id: &JobId,
        user_id: &UserId,
        text: &str,
    ) -> Result<GenerationJob, ServiceError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ServiceError::Validation("text is required".to_string()));
        }

        let job = self.awaiting_job(job_id, user_id).await?;
        let state = self.load_conversation(&job).await?;
        if state.agent_status != AgentStatus::Paused {
            return Err(ServiceError::Conflict(
                "conversation is not waiting for a reply".to_string(),
            ));
        }

        let state =
            self.flow.append_message(&state, ConversationMessage::user(state.current_step, text));
        self.conversations.save(&job.user_id, state).await?;
        self.resume_and_trigger(&job).await
    }

    /// Approves or rejects plan generation for a conversation parked at the approval gate.
    pub async fn resolve_approval(
        self: &Arc<Self>,
        job_id: &JobId,
        user_id: &UserId,
        approved: bool,
    ) -> Result<GenerationJob, ServiceError> {
        let job = self.awaiting_job(job_id, user_id).await?;
        let state = self.load_conversation(&job).await?;
        if state.agent_status != AgentStatus::AwaitingApproval {
            return Err(ServiceError::Conflict("no approval is pending".to_string()));
        }

        if approved {
            let state = self.flow.append_message(
                &state,
                ConversationMessage::user(state.current_step, "Approved. Generate the plan."),
            );
            let state = self.flow.set_agent_status(&state, AgentStatus::Running)?;
            self.conversations.save(&job.user_id, state).await?;
            info!(event_name = "generation.job.approved", job_id = %job.id, "plan approved");
            return self.resume_and_trigger(&job).await;
        }

        let state = self.flow.append_message(
            &state,
            ConversationMessage::user(state.current_step, "Plan generation was not approved."),
        );
        let state = self.flow.set_agent_status(&state, AgentStatus::Error)?;
        self.conversations.save(&job.user_id, state).await?;

        let transition = self.engine.fail(&job, FailureCode::ApprovalRejected)?;
        if !self.apply(&transition).await? {
            return Err(ServiceError::Conflict("job changed concurrently".to_string()));
        }
        info!(event_name = "generation.job.rejected", job_id = %job.id, "plan rejected");
        self.jobs.get(job_id).await?.ok_or_else(|| ServiceError::NotFound(job_id.clone()))
    }

    pub async fn list_events(
        &self,
        job_id: &JobId,
        user_id: &UserId,
        after_id: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<JobEvent>, ServiceError> {
        if self.owned_job(job_id, user_id).await?.is_none() {
            return Err(ServiceError::NotFound(job_id.clone()));
        }
        let limit = limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
        Ok(self.jobs.list_events(job_id, after_id, limit).await?)
    }

    /// Returns running jobs whose owner stopped heartbeating to `pending`.
    pub async fn recover_stale_claims(&self, limit: u32) -> Result<u32, ServiceError> {
        let threshold = self.engine.stale_threshold(Utc::now());
        let mut released = 0;
        for job in self.jobs.list_stale_running(threshold, limit).await? {
            let transition = self.engine.release_stale(&job)?;
            if self.apply(&transition).await? {
                released += 1;
                warn!(
                    event_name = "generation.job.claim_released",
                    job_id = %job.id,
                    attempt = job.attempt,
                    "stale claim returned to pending"
                );
            }
        }
        Ok(released)
    }

    /// Pending jobs oldest first, then jobs parked on input whose cancellation is pending.
    pub async fn runnable_jobs(&self, limit: u32) -> Result<Vec<GenerationJob>, ServiceError> {
        let mut runnable = self.jobs.list_by_status(JobStatus::Pending, limit).await?;
        let room = limit.saturating_sub(runnable.len() as u32);
        if room > 0 {
            runnable.extend(
                self.jobs
                    .list_by_status(JobStatus::AwaitingInput, room)
                    .await?
                    .into_iter()
                    .filter(|job| job.cancel_requested),
            );
        }
        Ok(runnable)
    }

    async fn owned_job(
        &self,
        job_id: &JobId,
        user_id: &UserId,
    ) -> Result<Option<GenerationJob>, ServiceError> {
        match self.jobs.get(job_id).await? {
            Some(job) if job.is_owned_by(user_id) => Ok(Some(job)),
            Some(job) => {
                debug!(
                    event_name = "generation.job.foreign_access",
                    job_id = %job.id,
                    "job requested by a user that does not own it"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn awaiting_job(
        &self,
        job_id: &JobId,
        user_id: &UserId,
    ) -> Result<GenerationJob, ServiceError> {
        let job = self
            .owned_job(job_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(job_id.clone()))?;
        if job.status != JobStatus::AwaitingInput {
            return Err(ServiceError::Conflict(format!(
                "job is {}, not awaiting input",
                job.status.as_str()
            )));
        }
        if job.cancel_requested {
            return Err(ServiceError::Conflict("job cancellation is pending".to_string()));
        }
        Ok(job)
    }

    async fn load_conversation(
        &self,
        job: &GenerationJob,
    ) -> Result<ConversationState, ServiceError> {
        self.conversations
            .load(&job.user_id, &job.conversation_id)
            .await?
            .ok_or_else(|| ServiceError::Conflict("conversation has not started".to_string()))
    }

    async fn resume_and_trigger(
        self: &Arc<Self>,
        job: &GenerationJob,
    ) -> Result<GenerationJob, ServiceError> {
        let transition = self.engine.resume(job)?;
        if !self.apply(&transition).await? {
            return Err(ServiceError::Conflict("job changed concurrently".to_string()));
        }
        info!(event_name = "generation.job.resumed", job_id = %job.id, "generation job resumed");
        self.trigger_job(job.id.clone());
        self.jobs.get(&job.id).await?.ok_or_else(|| ServiceError::NotFound(job.id.clone()))
    }

    /// Status CAS plus its event. Returns false when the expected status or attempt no
    /// longer holds.
    async fn apply(&self, transition: &JobTransition) -> Result<bool, RepositoryError> {
        let swapped = self
            .jobs
            .compare_and_swap_status(
                &transition.job_id,
                transition.expected,
                Some(transition.expected_attempt),
                transition.next,
                &transition.patch,
            )
            .await?;
        if swapped {
            self.jobs.append_event(transition.event.clone()).await?;
        }
        Ok(swapped)
    }

    async fn cancel_unclaimed(&self, job: &GenerationJob) -> Result<RunOutcome, ServiceError> {
        let transition = self.engine.cancel(job)?;
        if !self.apply(&transition).await? {
            return Ok(RunOutcome::Skipped { reason: "cancel_raced" });
        }
        info!(
            event_name = "generation.job.cancelled",
            job_id = %job.id,
            observed_in = job.status.as_str(),
            "generation job cancelled before running"
        );
        Ok(RunOutcome::Cancelled)
    }

    async fn fail_job(
        &self,
        job_id: &JobId,
        attempt: u32,
        failure: DriverFailure,
    ) -> Result<RunOutcome, ServiceError> {
        error!(
            event_name = "generation.job.failed",
            job_id = %job_id,
            code = failure.code.as_str(),
            detail = %failure.detail,
            "generation job failed"
        );

        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(RunOutcome::Skipped { reason: "missing" });
        };
        if job.status.is_terminal() {
            return Ok(RunOutcome::Skipped { reason: "terminal" });
        }
        if job.status != JobStatus::Running || job.attempt != attempt {
            return Ok(RunOutcome::Skipped { reason: "claim_lost" });
        }

        match self.conversations.load(&job.user_id, &job.conversation_id).await {
            Ok(Some(state)) => {
                if let Ok(errored) = self.flow.set_agent_status(&state, AgentStatus::Error) {
                    if let Err(save_error) = self.conversations.save(&job.user_id, errored).await
                    {
                        warn!(
                            event_name = "generation.conversation.save_failed",
                            job_id = %job.id,
                            error = %save_error,
                            "could not mark conversation as errored"
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(load_error) => warn!(
                event_name = "generation.conversation.load_failed",
                job_id = %job.id,
                error = %load_error,
                "could not load conversation while failing the job"
            ),
        }

        let transition = self.engine.fail(&job, failure.code)?;
        if self.apply(&transition).await? {
            Ok(RunOutcome::Failed { code: failure.code })
        } else {
            Ok(RunOutcome::Skipped { reason: "fail_raced" })
        }
    }

    async fn drive(&self, claimed: GenerationJob) -> Result<RunOutcome, DriverFailure> {
        let mut state = match self.prepare_conversation(&claimed).await? {
            Prepared::Ready(state) => state,
            Prepared::AtApprovalGate(state) => {
                info!(
                    event_name = "generation.conversation.approval_pending",
                    job_id = %claimed.id,
                    conversation_id = %claimed.conversation_id,
                    "conversation is still waiting for plan approval"
                );
                let progress = self.flow.progress(&state).completion_percentage.min(99);
                return self.park_at_approval_gate(&claimed, state.current_step, progress).await;
            }
        };
        let context = ToolContext {
            user_id: claimed.user_id.clone(),
            conversation_id: claimed.conversation_id.clone(),
        };
        let limits = self.engine.config().clone();
        let mut budget = StepBudget::new(state.current_step);

        loop {
            let job = self.jobs.get(&claimed.id).await?.ok_or_else(|| {
                DriverFailure::new(FailureCode::InvariantViolation, "claimed job disappeared")
            })?;
            if job.status != JobStatus::Running || job.attempt != claimed.attempt {
                warn!(
                    event_name = "generation.job.claim_lost",
                    job_id = %job.id,
                    claimed_attempt = claimed.attempt,
                    current_attempt = job.attempt,
                    "claim no longer held, driver stopping"
                );
                return Ok(RunOutcome::Skipped { reason: "claim_lost" });
            }
            if job.cancel_requested {
                return self.cancel_running(&job).await;
            }
            self.jobs.update_fields(&job.id, &JobPatch::default()).await?;

            budget.observe(state.current_step);
            budget.turns += 1;
            if budget.turns > limits.max_turns_per_step {
                self.conversations.save(&job.user_id, state).await?;
                return Err(DriverFailure::new(
                    FailureCode::TurnLimitExceeded,
                    format!("step {} exceeded {} turns", budget.step.as_str(), budget.turns - 1),
                ));
            }

            let reply = match self.reason(&job, &state).await {
                Ok(reply) => reply,
                Err(failure) => {
                    self.conversations.save(&job.user_id, state).await?;
                    return Err(failure);
                }
            };

            match reply {
                ReasoningReply::ToolCall { name, arguments } => {
                    let (next, result) =
                        self.run_tool(&job, &context, &state, name, arguments).await;
                    state = next;

                    if result.is_error() {
                        budget.tool_failures += 1;
                    } else if result.name == GENERATE_PLAN {
                        let plan = result.output().cloned().unwrap_or(Value::Null);
                        return self.finish(&job, state, plan).await;
                    }
                }
                ReasoningReply::Text(text) => match parse_answer(&text) {
                    // Only the generate_plan handler validates terms and totals credits.
                    Some(_) if state.current_step == Step::GeneratingPlan => {
                        state = self.flow.append_message(
                            &state,
                            ConversationMessage::assistant(Step::GeneratingPlan, text),
                        );
                        state = self.flow.append_message(
                            &state,
                            ConversationMessage::user(
                                Step::GeneratingPlan,
                                "A plan written as text is not accepted. Submit it by calling \
                                 generate_plan.",
                            ),
                        );
                        budget.tool_failures += 1;
                        debug!(
                            event_name = "generation.plan.text_rejected",
                            job_id = %job.id,
                            "plan answered as text instead of a generate_plan call"
                        );
                    }
                    Some(answer) => {
                        let step = state.current_step;
                        state = self
                            .flow
                            .append_message(&state, ConversationMessage::assistant(step, text));
                        let (next_state, next_step) = self.flow.complete_step(&state, answer)?;
                        state = next_state;
                        if let Some(outcome) =
                            self.record_step(&job, &mut state, step, next_step).await?
                        {
                            return Ok(outcome);
                        }
                    }
                    None => return self.pause_for_input(&job, state, text).await,
                },
            }

            if budget.tool_failures > limits.max_tool_failures_per_step {
                self.conversations.save(&job.user_id, state).await?;
                return Err(DriverFailure::new(
                    FailureCode::ToolFailureBudgetExceeded,
                    format!(
                        "step {} recorded {} tool failures",
                        budget.step.as_str(),
                        budget.tool_failures
                    ),
                ));
            }
        }
    }

    /// Loads or starts the conversation for a freshly claimed job and marks it running.
    async fn prepare_conversation(&self, job: &GenerationJob) -> Result<Prepared, DriverFailure> {
        let loaded = self.conversations.load(&job.user_id, &job.conversation_id).await?;
        let state = match loaded {
            Some(state) if state.agent_status.is_terminal() && job.attempt <= 1 => {
                info!(
                    event_name = "generation.conversation.restarted",
                    job_id = %job.id,
                    conversation_id = %job.conversation_id,
                    previous_status = state.agent_status.as_str(),
                    "finished conversation replaced by a fresh one"
                );
                self.flow.create_initial(job.conversation_id.clone())
            }
            Some(state) if state.agent_status.is_terminal() => {
                return Err(DriverFailure::new(
                    FailureCode::InvariantViolation,
                    format!(
                        "conversation is {} on attempt {}",
                        state.agent_status.as_str(),
                        job.attempt
                    ),
                ));
            }
            Some(state) => state,
            None => self.flow.create_initial(job.conversation_id.clone()),
        };

        if let Err(issue) = state.verify_transcript() {
            return Err(DriverFailure::new(
                FailureCode::InvariantViolation,
                format!("transcript is inconsistent: {issue:?}"),
            ));
        }

        if state.agent_status == AgentStatus::AwaitingApproval {
            return Ok(Prepared::AtApprovalGate(state));
        }

        let mut state = self.flow.set_agent_status(&state, AgentStatus::Running)?;
        if state.messages.is_empty() {
            state = self.flow.append_message(
                &state,
                ConversationMessage::user(
                    state.current_step,
                    format!("Please build my graduation plan. Request: {}", job.input_payload),
                ),
            );
        }
        self.conversations.save(&job.user_id, state.clone()).await?;
        Ok(Prepared::Ready(state))
    }

    /// True while `claimed` is still the job's live claim.
    async fn holds_claim(&self, claimed: &GenerationJob) -> Result<bool, RepositoryError> {
        Ok(self
            .jobs
            .get(&claimed.id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Running && job.attempt == claimed.attempt))
    }

    async fn reason(
        &self,
        job: &GenerationJob,
        state: &ConversationState,
    ) -> Result<ReasoningReply, DriverFailure> {
        let request = ReasoningRequest {
            step: state.current_step,
            system: system_prompt(state.current_step, &job.input_payload),
            transcript: state.messages.clone(),
            tools: self.registry.catalog(),
        };

        let mut failures = 0;
        loop {
            let timeout = self.settings.reasoning_timeout;
            let result = tokio::time::timeout(timeout, self.reasoning.complete(&request))
                .await
                .unwrap_or(Err(ReasoningError::Timeout(timeout)));

            let error = match result {
                Ok(reply) => return Ok(reply),
                Err(error) => error,
            };
            failures += 1;
            match self.engine.reasoning_retry(failures) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        event_name = "generation.reasoning.retry",
                        job_id = %job.id,
                        step = request.step.as_str(),
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "reasoning call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return Err(DriverFailure::new(
                        FailureCode::ReasoningUnavailable,
                        format!("{failures} reasoning attempts failed, last error: {error}"),
                    ));
                }
            }
        }
    }

    /// Validates and executes one tool call. Call and result are both appended to the
    /// working transcript; failures come back as error results.
    async fn run_tool(
        &self,
        job: &GenerationJob,
        context: &ToolContext,
        state: &ConversationState,
        name: String,
        arguments: Value,
    ) -> (ConversationState, ToolResult) {
        let step = state.current_step;
        let (call, result) = match self.registry.encode_call(&name, arguments.clone()) {
            Err(invalid) => {
                let call = ToolCall { id: ToolRegistry::next_call_id(), name, arguments };
                let result =
                    self.registry.encode_failure(&call.id, &call.name, invalid.to_string());
                (call, result)
            }
            Ok(call) if call.name == GENERATE_PLAN && step != Step::GeneratingPlan => {
                let result = self.registry.encode_failure(
                    &call.id,
                    &call.name,
                    format!(
                        "generate_plan is only available at the {} step",
                        Step::GeneratingPlan.label()
                    ),
                );
                (call, result)
            }
            Ok(call) => {
                let result = self.execute(context, &call).await;
                (call, result)
            }
        };

        let ok = !result.is_error();
        if let Err(event_error) = self
            .jobs
            .append_event(
                event(&job.id, JobEventType::ToolInvoked, Utc::now())
                    .with_step(step)
                    .with_payload(json!({ "tool": call.name, "callId": call.id.0, "ok": ok })),
            )
            .await
        {
            warn!(
                event_name = "generation.job.event_failed",
                job_id = %job.id,
                error = %event_error,
                "could not record tool event"
            );
        }
        debug!(
            event_name = "generation.tool.invoked",
            job_id = %job.id,
            tool = %call.name,
            ok,
            "tool call finished"
        );

        let state = self.flow.append_message(state, ConversationMessage::tool_call(step, call));
        let state = self
            .flow
            .append_message(&state, ConversationMessage::tool_result(step, result.clone()));
        (state, result)
    }

    async fn execute(&self, context: &ToolContext, call: &ToolCall) -> ToolResult {
        let Some(handler) = self.dispatcher.get(&call.name) else {
            return self.registry.encode_failure(&call.id, &call.name, "tool has no handler");
        };

        let timeout = self.settings.tool_timeout;
        let outcome = tokio::time::timeout(timeout, handler.invoke(context, call.arguments.clone()))
            .await
            .unwrap_or(Err(ToolExecutionError::Timeout(timeout)));

        match outcome {
            Ok(output) => self
                .registry
                .encode_result(&call.id, &call.name, output)
                .unwrap_or_else(|invalid| {
                    self.registry.encode_failure(&call.id, &call.name, invalid.to_string())
                }),
            Err(failure) => self.registry.encode_failure(&call.id, &call.name, failure.to_string()),
        }
    }

    /// Persists a completed step and updates the job's progress. Returns an outcome when
    /// the run stops at the approval gate.
    async fn record_step(
        &self,
        job: &GenerationJob,
        state: &mut ConversationState,
        completed: Step,
        next_step: Option<Step>,
    ) -> Result<Option<RunOutcome>, DriverFailure> {
        let Some(next_step) = next_step else {
            return Err(DriverFailure::new(
                FailureCode::InvariantViolation,
                format!("step {} has no successor", completed.as_str()),
            ));
        };

        if !self.holds_claim(job).await? {
            return Ok(Some(RunOutcome::Skipped { reason: "claim_lost" }));
        }
        self.conversations.save(&job.user_id, state.clone()).await?;
        let progress = self.flow.progress(state).completion_percentage.min(99);
        let patch = JobPatch {
            current_step: Some(next_step),
            progress_percent: Some(progress),
            ..JobPatch::default()
        };
        self.jobs.update_fields(&job.id, &patch).await?;
        self.jobs
            .append_event(
                event(&job.id, JobEventType::StepCompleted, Utc::now())
                    .with_step(completed)
                    .with_progress(progress)
                    .with_payload(json!({ "nextStep": next_step.as_str() })),
            )
            .await?;
        info!(
            event_name = "generation.step.completed",
            job_id = %job.id,
            step = completed.as_str(),
            next_step = next_step.as_str(),
            progress,
            "conversation step completed"
        );

        if next_step != Step::GeneratingPlan || !job.requires_approval() {
            return Ok(None);
        }

        *state = self.flow.set_agent_status(state, AgentStatus::AwaitingApproval)?;
        self.conversations.save(&job.user_id, state.clone()).await?;
        self.park_at_approval_gate(job, next_step, progress).await.map(Some)
    }

    async fn park_at_approval_gate(
        &self,
        job: &GenerationJob,
        step: Step,
        progress: u8,
    ) -> Result<RunOutcome, DriverFailure> {
        let transition = self.engine.await_input(
            job,
            step,
            progress,
            "approval required before the plan is generated",
        )?;
        if !self.apply(&transition).await? {
            return Ok(RunOutcome::Skipped { reason: "claim_lost" });
        }
        info!(
            event_name = "generation.job.awaiting_approval",
            job_id = %job.id,
            "waiting for plan approval"
        );
        Ok(RunOutcome::AwaitingApproval)
    }

    async fn pause_for_input(
        &self,
        job: &GenerationJob,
        state: ConversationState,
        question: String,
    ) -> Result<RunOutcome, DriverFailure> {
        let step = state.current_step;
        let state =
            self.flow.append_message(&state, ConversationMessage::assistant(step, question));
        let state = self.flow.set_agent_status(&state, AgentStatus::Paused)?;
        let progress = self.flow.progress(&state).completion_percentage.min(99);
        if !self.holds_claim(job).await? {
            return Ok(RunOutcome::Skipped { reason: "claim_lost" });
        }
        self.conversations.save(&job.user_id, state).await?;

        let transition =
            self.engine.await_input(job, step, progress, "waiting for the student's reply")?;
        if !self.apply(&transition).await? {
            return Ok(RunOutcome::Skipped { reason: "claim_lost" });
        }
        info!(
            event_name = "generation.job.awaiting_input",
            job_id = %job.id,
            step = step.as_str(),
            "waiting for the student's reply"
        );
        Ok(RunOutcome::AwaitingInput { step })
    }

    async fn finish(
        &self,
        job: &GenerationJob,
        state: ConversationState,
        plan: Value,
    ) -> Result<RunOutcome, DriverFailure> {
        let (state, _) = self.flow.complete_step(&state, plan.clone())?;
        let state = self.flow.set_agent_status(&state, AgentStatus::Complete)?;
        if !self.holds_claim(job).await? {
            return Ok(RunOutcome::Skipped { reason: "claim_lost" });
        }
        self.conversations.save(&job.user_id, state).await?;

        let transition = self.engine.complete(job, plan)?;
        if !self.apply(&transition).await? {
            return Ok(RunOutcome::Skipped { reason: "claim_lost" });
        }
        info!(
            event_name = "generation.job.completed",
            job_id = %job.id,
            attempt = job.attempt,
            "graduation plan generated"
        );
        Ok(RunOutcome::Completed)
    }

    /// Cancel observed mid-run. The unsaved working copy of the conversation is dropped.
    async fn cancel_running(&self, job: &GenerationJob) -> Result<RunOutcome, DriverFailure> {
        let transition = self.engine.cancel(job)?;
        if !self.apply(&transition).await? {
            return Ok(RunOutcome::Skipped { reason: "cancel_raced" });
        }
        info!(
            event_name = "generation.job.cancelled",
            job_id = %job.id,
            step = job.current_step.map(|step| step.as_str()),
            "generation job cancelled while running"
        );
        Ok(RunOutcome::Cancelled)
    }
}

fn log_reuse(existing: &GenerationJob, requested_fingerprint: &str) {
    if existing.input_fingerprint != requested_fingerprint {
        warn!(
            event_name = "generation.job.reused_with_different_input",
            job_id = %existing.id,
            conversation_id = %existing.conversation_id,
            "active job reused; the new input payload is ignored"
        );
    } else {
        info!(
            event_name = "generation.job.reused",
            job_id = %existing.id,
            conversation_id = %existing.conversation_id,
            "active job reused"
        );
    }
}

/// A step answer is a JSON object, optionally wrapped in a fenced code block.
fn parse_answer(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|body| body.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str::<Value>(unfenced).ok().filter(Value::is_object)
}
