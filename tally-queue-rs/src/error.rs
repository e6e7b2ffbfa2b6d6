//! Queue and executor errors

use tally_core::{Classify, ErrorClass, VoteError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),
}

/// Failure reported by an operation executor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The server rejected the operation
    #[error("Rejected: {0}")]
    Business(String),

    /// Network or server fault
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl Classify for ExecutorError {
    fn class(&self) -> ErrorClass {
        match self {
            ExecutorError::Business(_) => ErrorClass::Business,
            ExecutorError::Transient(_) => ErrorClass::Transient,
        }
    }
}

impl From<VoteError> for ExecutorError {
    fn from(e: VoteError) -> Self {
        if e.is_retryable() {
            ExecutorError::Transient(e.to_string())
        } else {
            ExecutorError::Business(e.to_string())
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
