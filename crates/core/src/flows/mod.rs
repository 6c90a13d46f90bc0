pub mod agent_status;
pub mod conversation;
pub mod steps;

use thiserror::Error;

use crate::domain::conversation::{AgentStatus, Step};

pub use agent_status::validate_agent_transition;
pub use conversation::{ConversationFlow, ConversationProgress};
pub use steps::{EdgeKind, StepConnector, StepEdge, StepGraph};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("answer filed under {actual:?} while the current step is {expected:?}")]
    StepMismatch { expected: Step, actual: Step },
    #[error("invalid agent status transition from {from:?} to {to:?}")]
    InvalidStatusTransition { from: AgentStatus, to: AgentStatus },
    #[error("cannot advance from {from:?} to {to:?}")]
    BackwardAdvance { from: Step, to: Step },
    #[error("step {0:?} is already completed")]
    StepAlreadyCompleted(Step),
    #[error("cannot navigate back to {target:?}: {reason}")]
    NavigationRejected { target: Step, reason: String },
    #[error("edge from {from:?} to {to:?} would introduce a cycle")]
    CyclicEdge { from: Step, to: Step },
    #[error("bypass from {from:?} to {to:?} duplicates the sequential edge")]
    RedundantBypass { from: Step, to: Step },
}
