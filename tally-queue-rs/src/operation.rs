//! Queued client operations
//!
//! Each deferrable app operation is one variant of [`Operation`], so
//! executors dispatch exhaustively and persisted payloads stay typed.

use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::{ItemId, RoomId, VoteKind};
use uuid::Uuid;

/// Drain priority; lower sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Eviction order under capacity pressure
    pub const EVICTION_ORDER: [Priority; 3] = [Priority::Low, Priority::Medium, Priority::High];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "HIGH"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Deferrable operation with its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    Vote {
        room_id: RoomId,
        item_id: ItemId,
        kind: VoteKind,
    },

    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    CreateRoom {
        capacity: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    UpdateFilters { room_id: RoomId, filters: Value },
}

/// Discriminant of [`Operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Vote,
    JoinRoom,
    CreateRoom,
    LeaveRoom,
    UpdateFilters,
}

impl OperationType {
    pub const ALL: [OperationType; 5] = [
        OperationType::Vote,
        OperationType::JoinRoom,
        OperationType::CreateRoom,
        OperationType::LeaveRoom,
        OperationType::UpdateFilters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Vote => "VOTE",
            OperationType::JoinRoom => "JOIN_ROOM",
            OperationType::CreateRoom => "CREATE_ROOM",
            OperationType::LeaveRoom => "LEAVE_ROOM",
            OperationType::UpdateFilters => "UPDATE_FILTERS",
        }
    }

    /// Priority used when the caller does not choose one
    pub fn default_priority(&self) -> Priority {
        match self {
            OperationType::Vote | OperationType::JoinRoom => Priority::High,
            OperationType::CreateRoom | OperationType::LeaveRoom => Priority::Medium,
            OperationType::UpdateFilters => Priority::Low,
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| QueueError::UnknownOperation(s.to_string()))
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationType {
        match self {
            Operation::Vote { .. } => OperationType::Vote,
            Operation::JoinRoom { .. } => OperationType::JoinRoom,
            Operation::CreateRoom { .. } => OperationType::CreateRoom,
            Operation::LeaveRoom { .. } => OperationType::LeaveRoom,
            Operation::UpdateFilters { .. } => OperationType::UpdateFilters,
        }
    }
}

/// Operation waiting for connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: Uuid,
    #[serde(flatten)]
    pub operation: Operation,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QueuedOperation {
    pub fn kind(&self) -> OperationType {
        self.operation.kind()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Decode one persisted record, rejecting operation types this build does not know
    pub fn from_value(value: Value) -> Result<Self, QueueError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| QueueError::UnknownOperation("<missing>".into()))?;
        tag.parse::<OperationType>()?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_order() {
        let mut tiers = vec![Priority::Low, Priority::High, Priority::Medium];
        tiers.sort();
        assert_eq!(tiers, vec![Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn test_default_priorities() {
        assert_eq!(OperationType::Vote.default_priority(), Priority::High);
        assert_eq!(OperationType::LeaveRoom.default_priority(), Priority::Medium);
        assert_eq!(OperationType::UpdateFilters.default_priority(), Priority::Low);
    }

    #[test]
    fn test_persisted_shape() {
        let op = QueuedOperation {
            id: Uuid::new_v4(),
            operation: Operation::Vote {
                room_id: "r1".into(),
                item_id: "x".into(),
                kind: VoteKind::Like,
            },
            priority: Priority::High,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "VOTE");
        assert_eq!(value["payload"]["roomId"], "r1");
        assert_eq!(value["retryCount"], 0);

        assert_eq!(QueuedOperation::from_value(value).unwrap(), op);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let value = json!({
            "id": Uuid::new_v4(),
            "type": "SEND_INVITE",
            "payload": {},
        });
        assert!(matches!(
            QueuedOperation::from_value(value),
            Err(QueueError::UnknownOperation(t)) if t == "SEND_INVITE"
        ));
    }
}
