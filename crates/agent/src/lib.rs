//! OPERATOR: Agent core
//!
//! Drives the model through tool calls: descriptors are adapted for function
//! calling, every proposed call passes the control layer, and results come
//! back wrapped with a summary and an instruction.

use thiserror::Error;

pub mod context;
pub mod control;
pub mod guidance;
pub mod loop_agent;
pub mod schema;
pub mod tools;
pub mod wrapper;

pub use context::ContextBuilder;
pub use control::{CallBudget, CallRecord, ControlContext, ControlLayer, Refusal, Termination, Verdict};
pub use guidance::Guidance;
pub use loop_agent::{AgentLoop, AgentSettings, CallSummary, Reply};
pub use schema::{from_model_call, to_model_tool, SchemaValidationError};
pub use tools::{register_plan_tools, LocalTool, ToolRegistry};
pub use wrapper::ResultWrapper;

/// Operator errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("◆ MODEL LINK ERROR: {0}")]
    Provider(String),

    #[error("◆ NO FINAL ANSWER AFTER {0} TURNS")]
    MaxTurns(u32),

    #[error("◆ LOGBOOK ERROR: {0}")]
    Session(#[from] labrelay_session::SessionError),

    #[error("◆ DATA LINK ERROR: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
