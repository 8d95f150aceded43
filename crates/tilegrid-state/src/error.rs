//! State store errors.
//!
//! Every redb failure is flattened to its message: callers in the scheduler
//! only distinguish "the store is unavailable this tick" from "the row does
//! not exist", and the latter is expressed as `Ok(None)`.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// A per-owner connector was requested for an id that is neither a
    /// project nor a stage.
    #[error("unknown tile table owner: {0}")]
    UnknownOwner(String),
}
