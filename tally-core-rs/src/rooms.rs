//! Room and membership records
//!
//! Thin typed view over the keyed store. Room CRUD policy lives with the
//! room-management service; the helpers here only seed and read records
//! and perform the single conditional MATCHED transition.

use crate::error::{StoreError, VoteError};
use crate::retry::{RetryError, RetryPolicy};
use crate::store::{Condition, KeyValueStore};
use crate::types::{keys, ItemId, Membership, Room, RoomStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

const SHOWN_FIELD: &str = "items";

/// Result of attempting the MATCHED transition
#[derive(Debug, Clone, PartialEq)]
pub enum MatchTransition {
    /// This caller performed the transition
    Matched(Room),
    /// Another writer got there first; carries the room as re-read
    AlreadyDecided(Room),
}

impl MatchTransition {
    pub fn room(&self) -> &Room {
        match self {
            MatchTransition::Matched(room) | MatchTransition::AlreadyDecided(room) => room,
        }
    }

    pub fn into_room(self) -> Room {
        match self {
            MatchTransition::Matched(room) | MatchTransition::AlreadyDecided(room) => room,
        }
    }
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, VoteError> {
    serde_json::from_value(value).map_err(|e| VoteError::InvalidRecord(format!("{}: {}", key, e)))
}

fn encode<T: serde::Serialize>(record: &T) -> Result<Value, VoteError> {
    serde_json::to_value(record).map_err(|e| VoteError::InvalidRecord(e.to_string()))
}

/// Typed access to room and membership records
#[derive(Clone)]
pub struct RoomDirectory {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
}

impl RoomDirectory {
    pub fn new(store: Arc<dyn KeyValueStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>, VoteError> {
        let key = keys::room(room_id);
        let record = self.retry.run("get room", || self.store.get(&key)).await?;
        record.map(|v| decode(&key, v)).transpose()
    }

    pub async fn get_membership(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Option<Membership>, VoteError> {
        let key = keys::membership(room_id, user_id);
        let record = self.retry.run("get membership", || self.store.get(&key)).await?;
        record.map(|v| decode(&key, v)).transpose()
    }

    /// Set MATCHED + result item, guarded by "still votable and no result".
    ///
    /// Losing the guard is an expected outcome, reported as
    /// [`MatchTransition::AlreadyDecided`] with the room as it now stands.
    pub async fn transition_to_matched(
        &self,
        room_id: &str,
        item_id: &str,
        matched_at: DateTime<Utc>,
    ) -> Result<MatchTransition, VoteError> {
        let key = keys::room(room_id);
        let guard = Condition::All(vec![
            Condition::field_in(
                "status",
                RoomStatus::VOTABLE.iter().map(|s| json!(s.as_str())),
            ),
            Condition::field_missing("resultItemId"),
        ]);

        let mut fields = Map::new();
        fields.insert("status".into(), json!(RoomStatus::Matched.as_str()));
        fields.insert("resultItemId".into(), json!(item_id));
        fields.insert("matchedAt".into(), encode(&matched_at)?);

        let result = self
            .retry
            .run("transition to matched", || {
                self.store.update(&key, fields.clone(), guard.clone())
            })
            .await;

        match result {
            Ok(record) => {
                info!("Rooms: Room {} MATCHED on {}", room_id, item_id);
                Ok(MatchTransition::Matched(decode(&key, record)?))
            }
            Err(RetryError::Business(StoreError::ConditionFailed)) => {
                debug!("Rooms: Match transition for {} already decided", room_id);
                let room = self
                    .get_room(room_id)
                    .await?
                    .ok_or_else(|| VoteError::RoomNotVotable(room_id.to_string()))?;
                Ok(MatchTransition::AlreadyDecided(room))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotently record that `item_id` was presented in the room
    pub async fn mark_shown(&self, room_id: &str, item_id: &str) -> Result<(), VoteError> {
        let key = keys::shown(room_id);
        self.retry
            .run("mark shown", || {
                self.store.add_to_set(&key, SHOWN_FIELD, json!(item_id))
            })
            .await?;
        Ok(())
    }

    pub async fn shown_items(&self, room_id: &str) -> Result<BTreeSet<ItemId>, VoteError> {
        let key = keys::shown(room_id);
        let record = self.retry.run("get shown items", || self.store.get(&key)).await?;
        Ok(record
            .as_ref()
            .and_then(|r| r.get(SHOWN_FIELD))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Items already presented or voted on, for excluding from new candidates
    pub async fn voted_items(&self, room_id: &str) -> Result<BTreeSet<ItemId>, VoteError> {
        let mut items = self.shown_items(room_id).await?;
        let prefix = keys::votes_in(room_id);
        let votes = self.retry.run("scan votes", || self.store.scan_prefix(&prefix)).await?;
        for (_, record) in votes {
            if let Some(item) = record.get("itemId").and_then(Value::as_str) {
                items.insert(item.to_string());
            }
        }
        if let Some(room) = self.get_room(room_id).await? {
            items.extend(room.result_item_id);
        }
        Ok(items)
    }

    /// Seed a room in WAITING status
    pub async fn create_room(&self, room_id: &str, quorum: u32) -> Result<Room, VoteError> {
        if quorum == 0 {
            return Err(VoteError::InvalidRecord("quorum must be at least 1".into()));
        }
        let room = Room::new(room_id, quorum);
        let key = keys::room(room_id);
        let value = encode(&room)?;
        match self
            .retry
            .run("create room", || {
                self.store.put(&key, value.clone(), Condition::Absent)
            })
            .await
        {
            Ok(()) => Ok(room),
            Err(RetryError::Business(StoreError::ConditionFailed)) => Err(VoteError::InvalidRecord(
                format!("room {} already exists", room_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// WAITING -> ACTIVE; a no-op for rooms already past WAITING
    pub async fn activate_room(&self, room_id: &str) -> Result<Room, VoteError> {
        let key = keys::room(room_id);
        let mut fields = Map::new();
        fields.insert("status".into(), json!(RoomStatus::Active.as_str()));
        let guard = Condition::field_in("status", [json!(RoomStatus::Waiting.as_str())]);

        match self
            .retry
            .run("activate room", || {
                self.store.update(&key, fields.clone(), guard.clone())
            })
            .await
        {
            Ok(record) => decode(&key, record),
            Err(RetryError::Business(StoreError::ConditionFailed)) => self
                .get_room(room_id)
                .await?
                .ok_or_else(|| VoteError::RoomNotVotable(room_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert an active membership
    pub async fn join_room(&self, room_id: &str, user_id: &str) -> Result<Membership, VoteError> {
        let membership = Membership {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            is_active: true,
            joined_at: Utc::now(),
        };
        let key = keys::membership(room_id, user_id);
        let value = encode(&membership)?;
        self.retry
            .run("join room", || {
                self.store.put(&key, value.clone(), Condition::Always)
            })
            .await?;
        Ok(membership)
    }

    /// Mark a membership inactive; the record is kept
    pub async fn leave_room(&self, room_id: &str, user_id: &str) -> Result<(), VoteError> {
        let key = keys::membership(room_id, user_id);
        let mut fields = Map::new();
        fields.insert("isActive".into(), json!(false));
        match self
            .retry
            .run("leave room", || {
                self.store.update(&key, fields.clone(), Condition::Present)
            })
            .await
        {
            Ok(_) | Err(RetryError::Business(StoreError::ConditionFailed)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
