//! Generation job orchestration for graduation plans.
//!
//! - `tools`: declared tools, argument/result schemas and transcript envelopes
//! - `dispatch`: tool handlers backed by the catalog store
//! - `llm`: reasoning service clients
//! - `service`: job lifecycle and the step driver
//! - `worker`: bounded trigger pool and the pollable worker cycle
//!
//! The reasoning service only proposes answers, questions and tool calls. Step
//! order, status transitions and persistence are decided here.

pub mod dispatch;
pub mod llm;
mod prompt;
pub mod runtime;
pub mod service;
pub mod tools;
pub mod worker;

pub use dispatch::{ToolContext, ToolDispatcher, ToolExecutionError, ToolHandler};
pub use llm::{
    OpenAiCompatibleClient, ReasoningClient, ReasoningError, ReasoningReply, ReasoningRequest,
    ScriptedReasoningClient,
};
pub use runtime::{CatalogCheck, RuntimeInit, RuntimeInitError};
pub use service::{
    GenerationJobService, RunOutcome, ServiceDependencies, ServiceError, ServiceSettings,
};
pub use tools::{ToolRegistry, ToolRegistryError};
pub use worker::{WorkerCycleReport, WorkerCycleRunner, WorkerPool};
