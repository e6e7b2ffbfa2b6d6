//! Core types for tally voting rooms

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a voting room
pub type RoomId = String;

/// Opaque identifier of a participant
pub type UserId = String;

/// Opaque identifier of a candidate item supplied by the catalog
pub type ItemId = String;

/// Room lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    Active,
    Matched,
    Completed,
}

impl RoomStatus {
    /// Statuses in which votes are still accepted
    pub const VOTABLE: [RoomStatus; 2] = [RoomStatus::Waiting, RoomStatus::Active];

    pub fn is_votable(&self) -> bool {
        Self::VOTABLE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "WAITING",
            RoomStatus::Active => "ACTIVE",
            RoomStatus::Matched => "MATCHED",
            RoomStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preference expressed on a candidate item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Like,
    Dislike,
}

impl VoteKind {
    /// Only positive votes carry consensus weight
    pub fn is_positive(&self) -> bool {
        matches!(self, VoteKind::Like)
    }
}

impl std::fmt::Display for VoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteKind::Like => write!(f, "like"),
            VoteKind::Dislike => write!(f, "dislike"),
        }
    }
}

/// Room record as persisted by the room-management collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: RoomId,
    pub status: RoomStatus,
    /// Fixed capacity agreed at creation, used as the voting quorum
    pub quorum: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_item_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(room_id: impl Into<RoomId>, quorum: u32) -> Self {
        Self {
            room_id: room_id.into(),
            status: RoomStatus::Waiting,
            quorum,
            result_item_id: None,
            matched_at: None,
            created_at: Utc::now(),
        }
    }

    /// Votable status and no result decided yet
    pub fn accepts_votes(&self) -> bool {
        self.status.is_votable() && self.result_item_id.is_none()
    }

    pub fn is_matched(&self) -> bool {
        self.status == RoomStatus::Matched || self.result_item_id.is_some()
    }
}

/// Participation of a user in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}

/// Immutable record of one vote; its existence is the duplicate guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub kind: VoteKind,
    pub voted_at: DateTime<Utc>,
}

impl VoteRecord {
    pub fn new(room_id: &str, user_id: &str, item_id: &str, kind: VoteKind) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            kind,
            voted_at: Utc::now(),
        }
    }
}

/// Running tally of positive votes for one (room, item)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub room_id: RoomId,
    pub item_id: ItemId,
    pub count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Room projection returned to voters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub room_id: RoomId,
    pub status: RoomStatus,
    pub quorum: u32,
    pub result_item_id: Option<ItemId>,
    pub matched_at: Option<DateTime<Utc>>,
}

impl From<&Room> for RoomView {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.room_id.clone(),
            status: room.status,
            quorum: room.quorum,
            result_item_id: room.result_item_id.clone(),
            matched_at: room.matched_at,
        }
    }
}

impl From<Room> for RoomView {
    fn from(room: Room) -> Self {
        RoomView::from(&room)
    }
}

/// Progress notification emitted while an item is below quorum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteProgress {
    pub room_id: RoomId,
    pub item_id: ItemId,
    pub count: u64,
    pub quorum: u32,
}

/// Match announcement emitted once per room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchEvent {
    pub room_id: RoomId,
    pub item_id: ItemId,
    pub participants: Vec<UserId>,
    pub matched_at: DateTime<Utc>,
}

/// Store key layout shared by all record kinds
pub mod keys {
    pub const ROOM: &str = "room";
    pub const MEMBER: &str = "member";
    pub const VOTE: &str = "vote";
    pub const AGGREGATE: &str = "agg";
    pub const SHOWN: &str = "shown";

    const SEP: char = '#';

    pub fn room(room_id: &str) -> String {
        format!("{}{}{}", ROOM, SEP, room_id)
    }

    pub fn membership(room_id: &str, user_id: &str) -> String {
        format!("{}{}{}{}{}", MEMBER, SEP, room_id, SEP, user_id)
    }

    pub fn vote(room_id: &str, user_id: &str, item_id: &str) -> String {
        format!("{}{}{}{}{}{}{}", VOTE, SEP, room_id, SEP, user_id, SEP, item_id)
    }

    /// Prefix covering every vote record of a room
    pub fn votes_in(room_id: &str) -> String {
        format!("{}{}{}{}", VOTE, SEP, room_id, SEP)
    }

    pub fn aggregate(room_id: &str, item_id: &str) -> String {
        format!("{}{}{}{}{}", AGGREGATE, SEP, room_id, SEP, item_id)
    }

    /// Prefix covering every aggregate of a room
    pub fn aggregates_in(room_id: &str) -> String {
        format!("{}{}{}{}", AGGREGATE, SEP, room_id, SEP)
    }

    pub fn shown(room_id: &str) -> String {
        format!("{}{}{}", SHOWN, SEP, room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_serialization_omits_unset_result() {
        let room = Room::new("r1", 3);
        let value = serde_json::to_value(&room).unwrap();

        assert_eq!(value["status"], "WAITING");
        assert_eq!(value["quorum"], 3);
        assert!(value.get("resultItemId").is_none());

        let parsed: Room = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, room);
        assert!(parsed.accepts_votes());
    }

    #[test]
    fn test_matched_room_rejects_votes() {
        let mut room = Room::new("r1", 2);
        room.status = RoomStatus::Matched;
        room.result_item_id = Some("x".to_string());
        assert!(!room.accepts_votes());
        assert!(room.is_matched());

        room.status = RoomStatus::Completed;
        assert!(!room.accepts_votes());
    }

    #[test]
    fn test_vote_prefix_does_not_overlap_rooms() {
        let key = keys::vote("r10", "alice", "x");
        assert!(key.starts_with(&keys::votes_in("r10")));
        assert!(!key.starts_with(&keys::votes_in("r1")));
    }
}
