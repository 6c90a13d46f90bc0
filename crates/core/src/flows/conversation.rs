use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::{
    AgentStatus, ConversationId, ConversationMessage, ConversationState, Step,
};
use crate::flows::agent_status::validate_agent_transition;
use crate::flows::steps::{StepConnector, StepGraph};
use crate::flows::FlowTransitionError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationProgress {
    pub current_step_number: usize,
    pub total_steps: usize,
    pub current_step_label: String,
    pub completion_percentage: u8,
}

/// Pure transitions over [`ConversationState`]. Every operation returns a new
/// value; persisting it is the caller's job.
#[derive(Clone, Debug)]
pub struct ConversationFlow<C = StepGraph> {
    connector: C,
}

impl Default for ConversationFlow<StepGraph> {
    fn default() -> Self {
        Self::new(StepGraph::default())
    }
}

impl<C> ConversationFlow<C>
where
    C: StepConnector,
{
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn create_initial(&self, conversation_id: ConversationId) -> ConversationState {
        let now = Utc::now();
        ConversationState {
            conversation_id,
            current_step: Step::ProfileCheck,
            completed_steps: Vec::new(),
            answers: Default::default(),
            messages: Vec::new(),
            agent_status: AgentStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    /// Files `answer` under the current step and marks it completed exactly once.
    pub fn record_answer(
        &self,
        state: &ConversationState,
        step: Step,
        answer: Value,
    ) -> Result<ConversationState, FlowTransitionError> {
        if step != state.current_step {
            return Err(FlowTransitionError::StepMismatch {
                expected: state.current_step,
                actual: step,
            });
        }

        let mut next = state.clone();
        if !next.completed_steps.contains(&step) {
            next.completed_steps.push(step);
        }
        next.answers.insert(step, answer);
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Moves the cursor forward. The target must lie ahead and must not be completed.
    pub fn advance_to(
        &self,
        state: &ConversationState,
        step: Step,
    ) -> Result<ConversationState, FlowTransitionError> {
        if step <= state.current_step {
            return Err(FlowTransitionError::BackwardAdvance { from: state.current_step, to: step });
        }
        if state.is_completed(step) {
            return Err(FlowTransitionError::StepAlreadyCompleted(step));
        }

        let mut next = state.clone();
        next.current_step = step;
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Records the answer and moves to whatever the connector picks next.
    /// Returns `None` as the second element once the final step has been answered.
    pub fn complete_step(
        &self,
        state: &ConversationState,
        answer: Value,
    ) -> Result<(ConversationState, Option<Step>), FlowTransitionError> {
        let step = state.current_step;
        let recorded = self.record_answer(state, step, answer.clone())?;
        match self.connector.next_step(&recorded, step, &answer) {
            Some(next_step) => Ok((self.advance_to(&recorded, next_step)?, Some(next_step))),
            None => Ok((recorded, None)),
        }
    }

    pub fn append_message(
        &self,
        state: &ConversationState,
        message: ConversationMessage,
    ) -> ConversationState {
        let mut next = state.clone();
        next.messages.push(message);
        next.updated_at = Utc::now();
        next
    }

    pub fn set_agent_status(
        &self,
        state: &ConversationState,
        status: AgentStatus,
    ) -> Result<ConversationState, FlowTransitionError> {
        validate_agent_transition(state.agent_status, status)?;
        let mut next = state.clone();
        next.agent_status = status;
        next.updated_at = Utc::now();
        Ok(next)
    }

    pub fn progress(&self, state: &ConversationState) -> ConversationProgress {
        let total_steps = Step::ALL.len();
        let done = Step::ALL
            .iter()
            .filter(|step| {
                state.is_completed(**step)
                    || (**step < state.current_step && self.connector.can_skip(state, **step))
            })
            .count();
        let completion_percentage = ((done * 100) as f64 / total_steps as f64).round() as u8;

        ConversationProgress {
            current_step_number: state.current_step.position(),
            total_steps,
            current_step_label: state.current_step.label().to_string(),
            completion_percentage,
        }
    }

    /// Returns to an already completed step, clearing its answer and the answers of
    /// every step that depends on it. The transcript is kept and gains a note.
    pub fn navigate_back(
        &self,
        state: &ConversationState,
        target: Step,
    ) -> Result<ConversationState, FlowTransitionError> {
        if state.agent_status.is_terminal() {
            return Err(FlowTransitionError::NavigationRejected {
                target,
                reason: format!("conversation is {}", state.agent_status.as_str()),
            });
        }
        if !state.is_completed(target) {
            return Err(FlowTransitionError::NavigationRejected {
                target,
                reason: "step has not been completed".to_string(),
            });
        }

        let reset = reset_set(target);
        let mut next = state.clone();
        next.completed_steps.retain(|step| !reset.contains(step));
        next.answers.retain(|step, _| !reset.contains(step));
        next.current_step = target;
        next.messages.push(ConversationMessage::user(
            target,
            format!("Returning to {} to revise the earlier answer.", target.label()),
        ));
        next.updated_at = Utc::now();
        Ok(next)
    }
}

fn reset_set(target: Step) -> Vec<Step> {
    let mut pending = vec![target];
    let mut reset = Vec::new();
    while let Some(step) = pending.pop() {
        if reset.contains(&step) {
            continue;
        }
        reset.push(step);
        pending.extend(step.dependents().iter().copied());
    }
    reset
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ConversationFlow;
    use crate::domain::conversation::{
        AgentStatus, ConversationId, ConversationMessage, ConversationState, Step,
    };
    use crate::flows::FlowTransitionError;

    fn flow() -> ConversationFlow {
        ConversationFlow::default()
    }

    fn initial() -> ConversationState {
        flow().create_initial(ConversationId("conv-1".to_string()))
    }

    #[test]
    fn create_initial_starts_idle_at_profile_check() {
        let state = initial();

        assert_eq!(state.current_step, Step::ProfileCheck);
        assert!(state.completed_steps.is_empty());
        assert!(state.answers.is_empty());
        assert!(state.messages.is_empty());
        assert_eq!(state.agent_status, AgentStatus::Idle);
    }

    #[test]
    fn record_answer_rejects_non_current_step() {
        let error = flow()
            .record_answer(&initial(), Step::ProgramSelection, json!({}))
            .expect_err("future step must be rejected");

        assert_eq!(
            error,
            FlowTransitionError::StepMismatch {
                expected: Step::ProfileCheck,
                actual: Step::ProgramSelection,
            }
        );
    }

    #[test]
    fn record_answer_is_idempotent_for_completed_steps() -> Result<(), FlowTransitionError> {
        let flow = flow();
        let state = flow.record_answer(&initial(), Step::ProfileCheck, json!({"v": 1}))?;
        let state = flow.record_answer(&state, Step::ProfileCheck, json!({"v": 2}))?;

        assert_eq!(state.completed_steps, vec![Step::ProfileCheck]);
        assert_eq!(state.answer(Step::ProfileCheck), Some(&json!({"v": 2})));
        Ok(())
    }

    #[test]
    fn complete_step_walks_the_skip_edge() -> Result<(), FlowTransitionError> {
        let flow = flow();
        let (state, next) = flow.complete_step(&initial(), json!({"verified": true}))?;
        assert_eq!(next, Some(Step::ProgramSelection));

        let (state, next) =
            flow.complete_step(&state, json!({"requires_course_selection": false}))?;
        assert_eq!(next, Some(Step::CreditDistribution));
        assert_eq!(state.current_step, Step::CreditDistribution);
        assert_eq!(state.completed_steps, vec![Step::ProfileCheck, Step::ProgramSelection]);
        assert!(!state.completed_steps.contains(&state.current_step));
        Ok(())
    }

    #[test]
    fn advance_rejects_backward_moves() -> Result<(), FlowTransitionError> {
        let flow = flow();
        let (state, _) = flow.complete_step(&initial(), json!({}))?;

        let error = flow.advance_to(&state, Step::ProfileCheck).expect_err("backward move");
        assert!(matches!(error, FlowTransitionError::BackwardAdvance { .. }));
        Ok(())
    }

    #[test]
    fn append_message_only_grows_the_transcript() {
        let flow = flow();
        let first =
            flow.append_message(&initial(), ConversationMessage::user(Step::ProfileCheck, "hi"));
        let second =
            flow.append_message(&first, ConversationMessage::assistant(Step::ProfileCheck, "hello"));

        assert_eq!(second.messages.len(), 2);
        assert_eq!(second.messages[0], first.messages[0]);
    }

    #[test]
    fn set_agent_status_enforces_state_machine() -> Result<(), FlowTransitionError> {
        let flow = flow();
        let error =
            flow.set_agent_status(&initial(), AgentStatus::Complete).expect_err("idle to complete");
        assert_eq!(
            error,
            FlowTransitionError::InvalidStatusTransition {
                from: AgentStatus::Idle,
                to: AgentStatus::Complete,
            }
        );

        let running = flow.set_agent_status(&initial(), AgentStatus::Running)?;
        let complete = flow.set_agent_status(&running, AgentStatus::Complete)?;
        assert_eq!(complete.agent_status, AgentStatus::Complete);
        Ok(())
    }

    #[test]
    fn progress_counts_skipped_steps_as_done() -> Result<(), FlowTransitionError> {
        let flow = flow();
        let progress = flow.progress(&initial());
        assert_eq!(progress.current_step_number, 1);
        assert_eq!(progress.completion_percentage, 0);

        let (state, _) = flow.complete_step(&initial(), json!({}))?;
        let (state, _) = flow.complete_step(&state, json!({"course_selection_method": "ai"}))?;
        let progress = flow.progress(&state);

        assert_eq!(progress.current_step_number, 4);
        assert_eq!(progress.current_step_label, "Credit Distribution");
        assert_eq!(progress.completion_percentage, 50);
        Ok(())
    }

    #[test]
    fn navigate_back_resets_dependent_steps() -> Result<(), FlowTransitionError> {
        let flow = flow();
        let (state, _) = flow.complete_step(&initial(), json!({"profile": true}))?;
        let (state, _) = flow.complete_step(&state, json!({"program_id": "cs-bs"}))?;
        let (state, _) = flow.complete_step(&state, json!({"courses": ["CS 101"]}))?;
        let messages_before = state.messages.len();

        let state = flow.navigate_back(&state, Step::ProgramSelection)?;

        assert_eq!(state.current_step, Step::ProgramSelection);
        assert_eq!(state.completed_steps, vec![Step::ProfileCheck]);
        assert!(state.answer(Step::CourseSelection).is_none());
        assert!(state.answer(Step::ProfileCheck).is_some());
        assert_eq!(state.messages.len(), messages_before + 1);
        Ok(())
    }

    #[test]
    fn navigate_back_rejects_unvisited_steps() {
        let error = flow()
            .navigate_back(&initial(), Step::CreditDistribution)
            .expect_err("step never completed");
        assert!(matches!(error, FlowTransitionError::NavigationRejected { .. }));
    }
}
