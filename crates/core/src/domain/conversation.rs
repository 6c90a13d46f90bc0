use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::tool::{ToolCall, ToolCallId, ToolResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ProfileCheck,
    ProgramSelection,
    CourseSelection,
    CreditDistribution,
    MilestonesAndConstraints,
    GeneratingPlan,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Self::ProfileCheck,
        Self::ProgramSelection,
        Self::CourseSelection,
        Self::CreditDistribution,
        Self::MilestonesAndConstraints,
        Self::GeneratingPlan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfileCheck => "profile_check",
            Self::ProgramSelection => "program_selection",
            Self::CourseSelection => "course_selection",
            Self::CreditDistribution => "credit_distribution",
            Self::MilestonesAndConstraints => "milestones_and_constraints",
            Self::GeneratingPlan => "generating_plan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "profile_check" => Some(Self::ProfileCheck),
            "program_selection" => Some(Self::ProgramSelection),
            "course_selection" => Some(Self::CourseSelection),
            "credit_distribution" => Some(Self::CreditDistribution),
            "milestones_and_constraints" => Some(Self::MilestonesAndConstraints),
            "generating_plan" => Some(Self::GeneratingPlan),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ProfileCheck => "Profile Review",
            Self::ProgramSelection => "Program Selection",
            Self::CourseSelection => "Course Selection",
            Self::CreditDistribution => "Credit Distribution",
            Self::MilestonesAndConstraints => "Academic Milestones",
            Self::GeneratingPlan => "Generate Plan",
        }
    }

    /// 1-based position in the fixed ordering.
    pub fn position(&self) -> usize {
        Self::ALL.iter().position(|step| step == self).map(|index| index + 1).unwrap_or(0)
    }

    /// Steps whose answers are invalidated when this step's answer changes.
    pub fn dependents(&self) -> &'static [Step] {
        match self {
            Self::ProfileCheck => &[Self::ProgramSelection],
            Self::ProgramSelection => &[
                Self::CourseSelection,
                Self::CreditDistribution,
                Self::MilestonesAndConstraints,
            ],
            Self::CourseSelection => &[Self::CreditDistribution],
            Self::CreditDistribution => &[Self::MilestonesAndConstraints],
            Self::MilestonesAndConstraints | Self::GeneratingPlan => &[],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    AwaitingApproval,
    Complete,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    User { text: String },
    Assistant { text: String },
    ToolCall { call: ToolCall },
    ToolResult { result: ToolResult },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub step: Step,
    pub recorded_at: DateTime<Utc>,
    pub body: MessageBody,
}

impl ConversationMessage {
    pub fn user(step: Step, text: impl Into<String>) -> Self {
        Self::at(step, MessageBody::User { text: text.into() })
    }

    pub fn assistant(step: Step, text: impl Into<String>) -> Self {
        Self::at(step, MessageBody::Assistant { text: text.into() })
    }

    pub fn tool_call(step: Step, call: ToolCall) -> Self {
        Self::at(step, MessageBody::ToolCall { call })
    }

    pub fn tool_result(step: Step, result: ToolResult) -> Self {
        Self::at(step, MessageBody::ToolResult { result })
    }

    fn at(step: Step, body: MessageBody) -> Self {
        Self { step, recorded_at: Utc::now(), body }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: ConversationId,
    pub current_step: Step,
    pub completed_steps: Vec<Step>,
    pub answers: BTreeMap<Step, Value>,
    pub messages: Vec<ConversationMessage>,
    pub agent_status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Problem found when checking call/result pairing in a transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranscriptIssue {
    OrphanResult(ToolCallId),
    DuplicateCallId(ToolCallId),
    DuplicateResult(ToolCallId),
}

impl ConversationState {
    pub fn is_completed(&self, step: Step) -> bool {
        self.completed_steps.contains(&step)
    }

    pub fn answer(&self, step: Step) -> Option<&Value> {
        self.answers.get(&step)
    }

    /// Number of tool call envelopes recorded so far; used to derive call ids.
    pub fn tool_call_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| matches!(message.body, MessageBody::ToolCall { .. }))
            .count()
    }

    /// Calls without a result. A non-empty list marks the conversation as stalled.
    pub fn pending_tool_calls(&self) -> Vec<&ToolCall> {
        let answered: HashSet<&ToolCallId> = self
            .messages
            .iter()
            .filter_map(|message| match &message.body {
                MessageBody::ToolResult { result } => Some(&result.call_id),
                _ => None,
            })
            .collect();

        self.messages
            .iter()
            .filter_map(|message| match &message.body {
                MessageBody::ToolCall { call } if !answered.contains(&call.id) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn verify_transcript(&self) -> Result<(), TranscriptIssue> {
        let mut calls = HashSet::new();
        let mut results = HashSet::new();

        for message in &self.messages {
            match &message.body {
                MessageBody::ToolCall { call } => {
                    if !calls.insert(call.id.clone()) {
                        return Err(TranscriptIssue::DuplicateCallId(call.id.clone()));
                    }
                }
                MessageBody::ToolResult { result } => {
                    if !calls.contains(&result.call_id) {
                        return Err(TranscriptIssue::OrphanResult(result.call_id.clone()));
                    }
                    if !results.insert(result.call_id.clone()) {
                        return Err(TranscriptIssue::DuplicateResult(result.call_id.clone()));
                    }
                }
                MessageBody::User { .. } | MessageBody::Assistant { .. } => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AgentStatus, Step};

    #[test]
    fn step_round_trips_from_storage_encoding() {
        for step in Step::ALL {
            assert_eq!(Step::parse(step.as_str()), Some(step));
        }
        assert_eq!(Step::parse("complete"), None);
    }

    #[test]
    fn agent_status_round_trips_from_storage_encoding() {
        let cases = [
            AgentStatus::Idle,
            AgentStatus::Running,
            AgentStatus::Paused,
            AgentStatus::AwaitingApproval,
            AgentStatus::Complete,
            AgentStatus::Error,
        ];

        for status in cases {
            assert_eq!(AgentStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn step_positions_follow_fixed_ordering() {
        assert_eq!(Step::ProfileCheck.position(), 1);
        assert_eq!(Step::GeneratingPlan.position(), 6);
        assert!(Step::ProgramSelection < Step::CreditDistribution);
    }

    #[test]
    fn answers_serialize_with_step_names_as_keys() {
        let mut answers = std::collections::BTreeMap::new();
        answers.insert(Step::ProgramSelection, json!({"program_id": "cs-bs"}));

        let encoded = serde_json::to_value(&answers).expect("answers serialize");
        assert_eq!(encoded, json!({"program_selection": {"program_id": "cs-bs"}}));
    }
}
