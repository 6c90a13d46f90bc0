pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod generation_engine;

pub use domain::catalog::{
    CourseOffering, Program, ProgramId, ProgramKind, ProgramRequirements, RequirementGroup,
    StudentProfile,
};
pub use domain::conversation::{
    AgentStatus, ConversationId, ConversationMessage, ConversationState, MessageBody, Step,
};
pub use domain::job::{
    GenerationJob, JobErrorInfo, JobEvent, JobEventType, JobId, JobPatch, JobStatus, NewJobEvent,
    UserId,
};
pub use domain::tool::{ToolCall, ToolCallId, ToolOutcome, ToolResult};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{ConversationFlow, FlowTransitionError, StepConnector, StepGraph};
pub use generation_engine::{
    FailureCode, GenerationEngine, GenerationEngineConfig, GenerationError, JobTransition,
    RetryDecision,
};
