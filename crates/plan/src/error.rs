use thiserror::Error;

use crate::backend::DesignOp;
use crate::model::PlanStatus;

/// Failures reported by a design backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("◆ DESIGN TOOL '{tool}' UNREACHABLE: {message}")]
    Unavailable { tool: String, message: String },

    #[error("◆ DESIGN OPERATION {op:?} REJECTED: {message}")]
    Rejected { op: DesignOp, message: String },

    #[error("◆ DESIGN OPERATION {op:?} RETURNED NONSENSE: {message}")]
    Malformed { op: DesignOp, message: String },
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("◆ PLAN NOT FOUND: '{requested}' (available: {})", available.join(", "))]
    NotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("◆ PLAN {id} CANNOT MOVE FROM {from} TO {to}")]
    InvalidTransition {
        id: String,
        from: PlanStatus,
        to: PlanStatus,
    },

    #[error("◆ UNKNOWN ELEMENT TYPE: {0}")]
    UnknownElement(String),

    #[error("◆ INVALID PLAN: {0}")]
    Invalid(String),

    #[error("◆ NO WRITABLE TARGET: {0}")]
    NoWritableTarget(String),

    #[error("◆ PLAN STORE LOCKED: {0}")]
    Lock(String),

    #[error("◆ UNKNOWN DESIGN OPERATION: {0}")]
    UnknownOperation(String),

    #[error("◆ PLAN STORE I/O FAILURE: {0}")]
    Io(#[from] std::io::Error),

    #[error("◆ PLAN STORE UNREADABLE: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, PlanError>;
