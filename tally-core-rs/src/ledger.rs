//! Vote ledger and aggregate counters
//!
//! The ledger holds one immutable record per (room, user, item); creating it
//! under an "absent" guard is the duplicate-vote check. Aggregates hold the
//! per-(room, item) positive tally, created lazily on the first increment.

use crate::error::{StoreError, VoteError};
use crate::retry::{RetryError, RetryPolicy};
use crate::rooms::decode;
use crate::store::{Condition, KeyValueStore};
use crate::types::{keys, Aggregate, UserId, VoteRecord};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const COUNT_FIELD: &str = "count";

/// Duplicate-guarded vote records
#[derive(Clone)]
pub struct VoteLedger {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
    /// Bound on create attempts that fail their guard with no record behind them
    conflict_retries: u32,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn KeyValueStore>, retry: RetryPolicy, conflict_retries: u32) -> Self {
        Self {
            store,
            retry,
            conflict_retries,
        }
    }

    /// Create the record exactly once.
    ///
    /// A failed guard is re-read: an existing record is a genuine duplicate
    /// ([`VoteError::AlreadyVoted`]); a missing one was a false conflict and
    /// the create is retried.
    pub async fn record(&self, vote: &VoteRecord) -> Result<(), VoteError> {
        let key = keys::vote(&vote.room_id, &vote.user_id, &vote.item_id);
        let value = serde_json::to_value(vote).map_err(|e| VoteError::InvalidRecord(e.to_string()))?;

        for attempt in 0..=self.conflict_retries {
            let created = self
                .retry
                .run("create vote record", || {
                    self.store.put(&key, value.clone(), Condition::Absent)
                })
                .await;

            match created {
                Ok(()) => {
                    debug!(
                        "Ledger: Recorded {} vote by {} on {} in {}",
                        vote.kind, vote.user_id, vote.item_id, vote.room_id
                    );
                    return Ok(());
                }
                Err(RetryError::Business(StoreError::ConditionFailed)) => {
                    if self.exists_key(&key).await? {
                        return Err(VoteError::AlreadyVoted {
                            room_id: vote.room_id.clone(),
                            user_id: vote.user_id.clone(),
                            item_id: vote.item_id.clone(),
                        });
                    }
                    warn!(
                        "Ledger: False conflict creating {} (attempt {}), retrying",
                        key,
                        attempt + 1
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(VoteError::unavailable(
            "create vote record",
            self.conflict_retries + 1,
            "unresolved write conflict",
        ))
    }

    pub async fn exists(&self, room_id: &str, user_id: &str, item_id: &str) -> Result<bool, VoteError> {
        self.exists_key(&keys::vote(room_id, user_id, item_id)).await
    }

    async fn exists_key(&self, key: &str) -> Result<bool, VoteError> {
        let record = self.retry.run("read vote record", || self.store.get(key)).await?;
        Ok(record.is_some())
    }

    /// Remove a record whose tally could not be applied
    pub async fn retract(&self, vote: &VoteRecord) -> Result<(), VoteError> {
        let key = keys::vote(&vote.room_id, &vote.user_id, &vote.item_id);
        match self
            .retry
            .run("retract vote record", || {
                self.store.delete(&key, Condition::Present)
            })
            .await
        {
            Ok(()) | Err(RetryError::Business(StoreError::ConditionFailed)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All records in a room
    pub async fn votes_in(&self, room_id: &str) -> Result<Vec<VoteRecord>, VoteError> {
        let prefix = keys::votes_in(room_id);
        let rows = self.retry.run("scan votes", || self.store.scan_prefix(&prefix)).await?;
        rows.into_iter().map(|(key, value)| decode(&key, value)).collect()
    }

    /// Users with a positive record for `item_id`
    pub async fn voters_for(&self, room_id: &str, item_id: &str) -> Result<Vec<UserId>, VoteError> {
        Ok(self
            .votes_in(room_id)
            .await?
            .into_iter()
            .filter(|v| v.item_id == item_id && v.kind.is_positive())
            .map(|v| v.user_id)
            .collect())
    }
}

/// Atomic per-(room, item) tallies
#[derive(Clone)]
pub struct AggregateCounter {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
    conflict_retries: u32,
}

impl AggregateCounter {
    pub fn new(store: Arc<dyn KeyValueStore>, retry: RetryPolicy, conflict_retries: u32) -> Self {
        Self {
            store,
            retry,
            conflict_retries,
        }
    }

    /// Add one positive vote and return the count this increment produced.
    ///
    /// Increments under "row exists"; an absent row is created with count 1
    /// under "row absent", and a lost create race falls back to incrementing.
    pub async fn increment(&self, room_id: &str, item_id: &str) -> Result<u64, VoteError> {
        let key = keys::aggregate(room_id, item_id);

        for attempt in 0..=self.conflict_retries {
            let mut set = Map::new();
            set.insert("updatedAt".into(), json!(Utc::now()));

            let incremented = self
                .retry
                .run("increment aggregate", || {
                    self.store
                        .increment(&key, COUNT_FIELD, 1, set.clone(), Condition::Present)
                })
                .await;

            match incremented {
                Ok(count) => return Ok(count.max(0) as u64),
                Err(RetryError::Business(StoreError::ConditionFailed)) => {}
                Err(e) => return Err(e.into()),
            }

            let aggregate = Aggregate {
                room_id: room_id.to_string(),
                item_id: item_id.to_string(),
                count: 1,
                updated_at: Utc::now(),
            };
            let value = serde_json::to_value(&aggregate)
                .map_err(|e| VoteError::InvalidRecord(e.to_string()))?;

            let created = self
                .retry
                .run("create aggregate", || {
                    self.store.put(&key, value.clone(), Condition::Absent)
                })
                .await;

            match created {
                Ok(()) => {
                    debug!("Ledger: Created aggregate {}", key);
                    return Ok(1);
                }
                Err(RetryError::Business(StoreError::ConditionFailed)) => {
                    debug!(
                        "Ledger: Lost create race on {} (attempt {}), incrementing instead",
                        key,
                        attempt + 1
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(VoteError::unavailable(
            "increment aggregate",
            self.conflict_retries + 1,
            "unresolved write conflict",
        ))
    }

    pub async fn count(&self, room_id: &str, item_id: &str) -> Result<u64, VoteError> {
        let key = keys::aggregate(room_id, item_id);
        let record = self.retry.run("read aggregate", || self.store.get(&key)).await?;
        Ok(record
            .as_ref()
            .and_then(|r| r.get(COUNT_FIELD))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Every aggregate in a room, in item order
    pub async fn tallies(&self, room_id: &str) -> Result<Vec<Aggregate>, VoteError> {
        let prefix = keys::aggregates_in(room_id);
        let rows = self
            .retry
            .run("scan aggregates", || self.store.scan_prefix(&prefix))
            .await?;
        rows.into_iter().map(|(key, value)| decode(&key, value)).collect()
    }
}
