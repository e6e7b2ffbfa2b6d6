//! Error taxonomy shared by the store, the retry policy and the consensus engine

use thiserror::Error;

/// Whether an error is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Deterministic outcome; retrying cannot change it
    Business,
    /// Throttling or infrastructure fault; may succeed on a later attempt
    Transient,
}

/// Errors that know their own retry class
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Failures reported by a durable keyed store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Condition check failed")]
    ConditionFailed,

    #[error("Request throttled")]
    Throttled,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal store error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::ConditionFailed | StoreError::Serialization(_) => ErrorClass::Business,
            StoreError::Throttled
            | StoreError::Unavailable(_)
            | StoreError::Internal(_)
            | StoreError::Io(_) => ErrorClass::Transient,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by vote processing
#[derive(Error, Debug)]
pub enum VoteError {
    #[error("Room {0} is not accepting votes")]
    RoomNotVotable(String),

    #[error("User {user_id} is not an active member of room {room_id}")]
    NotAMember { room_id: String, user_id: String },

    #[error("User {user_id} already voted for {item_id} in room {room_id}")]
    AlreadyVoted {
        room_id: String,
        user_id: String,
        item_id: String,
    },

    #[error("Infrastructure unavailable during {operation} after {attempts} attempts: {reason}")]
    InfrastructureUnavailable {
        operation: String,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl VoteError {
    /// True when a UI should offer "try again"
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoteError::InfrastructureUnavailable { .. })
    }

    pub(crate) fn unavailable(operation: &str, attempts: u32, reason: impl Into<String>) -> Self {
        VoteError::InfrastructureUnavailable {
            operation: operation.to_string(),
            attempts,
            reason: reason.into(),
        }
    }
}

impl Classify for VoteError {
    fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Business
        }
    }
}
