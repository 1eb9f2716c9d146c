//! BLUEPRINT: Confirmed multi-step design plans
//!
//! A plan is proposed, confirmed by the user, executed into an empty design and
//! then populated step by step. Plans live in a JSON store that several
//! processes may share.

pub mod backend;
pub mod catalog;
pub mod error;
pub mod model;
pub mod store;
pub mod workflow;

pub use backend::{DesignBackend, DesignOp, DesignOpTable, ElementPlacement, ToolDesignBackend};
pub use error::{BackendError, PlanError, Result};
pub use model::{Plan, PlanStatus, Step, StepResult, Target};
pub use store::{is_placeholder, LockedBook, PlanBook, PlanStore};
pub use workflow::{state_prompt, ExecuteReport, PopulateReport, ProposeRequest, Workflow};
