//! Scheduler error types.

use thiserror::Error;

use tilegrid_state::TileStatus;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("stage not found: {0}")]
    StageNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("task definition not found: {0}")]
    TaskNotFound(String),

    #[error("task execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("tile status cannot be set to {to:?} ({reason})")]
    InvalidTransition { to: TileStatus, reason: &'static str },

    #[error("project manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] tilegrid_state::StateError),

    #[error("worker error: {0}")]
    Worker(#[from] tilegrid_worker::WorkerError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
