//! Stop-on-match voting consensus
//!
//! `process_vote` validates the room and the voter, records the vote once,
//! bumps the item's aggregate and, when that increment reaches the room's
//! quorum, performs the single MATCHED transition. All coordination happens
//! through conditional writes in the store; there are no in-process locks.

use crate::error::VoteError;
use crate::events::{EventPublisher, PublishError};
use crate::ledger::{AggregateCounter, VoteLedger};
use crate::retry::RetryPolicy;
use crate::rooms::{MatchTransition, RoomDirectory};
use crate::store::KeyValueStore;
use crate::types::{keys, MatchEvent, Room, RoomView, VoteKind, VoteProgress, VoteRecord};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default bound on guard conflicts that are retried
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Consensus engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Policy wrapping every store call
    pub retry: RetryPolicy,
    /// Bound on false conflicts and lost create races
    pub conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

impl EngineConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }
}

/// Server-side vote processor
#[derive(Clone)]
pub struct ConsensusEngine {
    rooms: RoomDirectory,
    ledger: VoteLedger,
    aggregates: AggregateCounter,
    events: Arc<dyn EventPublisher>,
}

impl ConsensusEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            rooms: RoomDirectory::new(store.clone(), config.retry.clone()),
            ledger: VoteLedger::new(store.clone(), config.retry.clone(), config.conflict_retries),
            aggregates: AggregateCounter::new(store, config.retry, config.conflict_retries),
            events,
        }
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn ledger(&self) -> &VoteLedger {
        &self.ledger
    }

    pub fn aggregates(&self) -> &AggregateCounter {
        &self.aggregates
    }

    /// Process one vote and return the room as this caller observed it.
    ///
    /// Errors: [`VoteError::RoomNotVotable`], [`VoteError::NotAMember`],
    /// [`VoteError::AlreadyVoted`], [`VoteError::InfrastructureUnavailable`].
    pub async fn process_vote(
        &self,
        user_id: &str,
        room_id: &str,
        item_id: &str,
        kind: VoteKind,
    ) -> Result<RoomView, VoteError> {
        debug!(
            "Consensus: {} votes {} on {} in {}",
            user_id, kind, item_id, room_id
        );

        // 1. Room must exist and still be open
        let room = self
            .rooms
            .get_room(room_id)
            .await?
            .ok_or_else(|| VoteError::RoomNotVotable(room_id.to_string()))?;

        if room.is_matched() {
            debug!(
                "Consensus: Room {} already matched on {:?}, vote ignored",
                room_id, room.result_item_id
            );
            return Ok(RoomView::from(room));
        }
        if !room.accepts_votes() {
            return Err(VoteError::RoomNotVotable(room_id.to_string()));
        }

        // 2. Voter must be an active member
        match self.rooms.get_membership(room_id, user_id).await? {
            Some(m) if m.is_active => {}
            _ => {
                return Err(VoteError::NotAMember {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
        }

        // 3. Shown marker, regardless of vote kind
        if let Err(e) = self.rooms.mark_shown(room_id, item_id).await {
            warn!("Consensus: Failed to mark {} shown in {}: {}", item_id, room_id, e);
        }

        // 4. Negative votes carry no consensus weight
        if !kind.is_positive() {
            return Ok(RoomView::from(room));
        }

        // 5. Duplicate guard
        let vote = VoteRecord::new(room_id, user_id, item_id, kind);
        self.ledger.record(&vote).await?;

        // 6. Tally
        let count = match self.aggregates.increment(room_id, item_id).await {
            Ok(count) => count,
            Err(e) => {
                // Keep the record/tally pair consistent so the vote can be resubmitted.
                // If that fails too, the record blocks resubmission until removed by hand.
                if let Err(retract_err) = self.ledger.retract(&vote).await {
                    error!(
                        room_id,
                        user_id,
                        item_id,
                        key = %keys::vote(room_id, user_id, item_id),
                        "Consensus: Orphaned vote record needs repair, retract failed: {} (tally error: {})",
                        retract_err,
                        e
                    );
                }
                return Err(e);
            }
        };

        info!(
            "Consensus: {} has {}/{} votes in {}",
            item_id, count, room.quorum, room_id
        );

        // 7. Below quorum
        if count < u64::from(room.quorum) {
            let progress = VoteProgress {
                room_id: room_id.to_string(),
                item_id: item_id.to_string(),
                count,
                quorum: room.quorum,
            };
            log_publish_failure(room_id, self.events.publish_progress(&progress).await);
            return Ok(RoomView::from(room));
        }

        // 8. Quorum reached
        self.conclude(room, item_id).await
    }

    async fn conclude(&self, room: Room, item_id: &str) -> Result<RoomView, VoteError> {
        let matched_at = Utc::now();
        match self
            .rooms
            .transition_to_matched(&room.room_id, item_id, matched_at)
            .await?
        {
            MatchTransition::Matched(matched) => {
                let participants = match self.ledger.voters_for(&matched.room_id, item_id).await {
                    Ok(voters) => voters,
                    Err(e) => {
                        warn!("Consensus: Could not list voters for {}: {}", item_id, e);
                        Vec::new()
                    }
                };
                let event = MatchEvent {
                    room_id: matched.room_id.clone(),
                    item_id: item_id.to_string(),
                    participants,
                    matched_at: matched.matched_at.unwrap_or(matched_at),
                };
                info!(
                    "Consensus: MATCH {} in {} ({} participants)",
                    item_id,
                    matched.room_id,
                    event.participants.len()
                );
                log_publish_failure(&matched.room_id, self.events.publish_match(&event).await);
                Ok(RoomView::from(matched))
            }
            MatchTransition::AlreadyDecided(current) => {
                info!(
                    "Consensus: Room {} already decided ({:?}), returning existing view",
                    current.room_id, current.result_item_id
                );
                Ok(RoomView::from(current))
            }
        }
    }
}

fn log_publish_failure(room_id: &str, result: Result<(), PublishError>) {
    match result {
        Ok(()) => {}
        Err(PublishError::NoSubscribers) => {
            debug!("Consensus: No subscribers for events in {}", room_id)
        }
        Err(e) => warn!("Consensus: Event publish for {} failed: {}", room_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::events::{ChannelPublisher, RoomEvent};
    use crate::store::{Condition, MemoryStore};
    use crate::types::RoomStatus;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config() -> EngineConfig {
        EngineConfig::default().with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    async fn setup(quorum: u32, users: &[&str]) -> (ConsensusEngine, ChannelPublisher) {
        let publisher = ChannelPublisher::default();
        let engine = ConsensusEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(publisher.clone()),
            fast_config(),
        );
        engine.rooms().create_room("r1", quorum).await.unwrap();
        engine.rooms().activate_room("r1").await.unwrap();
        for user in users {
            engine.rooms().join_room("r1", user).await.unwrap();
        }
        (engine, publisher)
    }

    #[tokio::test]
    async fn test_three_voters_reach_match() {
        let (engine, publisher) = setup(3, &["a", "b", "c", "d"]).await;
        let mut events = publisher.subscribe();

        let view = engine.process_vote("a", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(view.status, RoomStatus::Active);
        let view = engine.process_vote("b", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(view.status, RoomStatus::Active);
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 2);

        let view = engine.process_vote("c", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(view.status, RoomStatus::Matched);
        assert_eq!(view.result_item_id.as_deref(), Some("x"));

        // Late vote on another item sees the decided room
        let late = engine.process_vote("d", "r1", "y", VoteKind::Like).await.unwrap();
        assert_eq!(late, view);
        assert_eq!(engine.aggregates().count("r1", "y").await.unwrap(), 0);

        let mut progress = 0;
        let mut matched = None;
        while let Ok(event) = events.try_recv() {
            match event {
                RoomEvent::Progress(_) => progress += 1,
                RoomEvent::Matched(m) => matched = Some(m),
            }
        }
        assert_eq!(progress, 2);
        let matched = matched.expect("match event");
        let mut participants = matched.participants.clone();
        participants.sort();
        assert_eq!(participants, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_duplicate_vote_does_not_increment() {
        let (engine, _) = setup(3, &["a"]).await;

        engine.process_vote("a", "r1", "x", VoteKind::Like).await.unwrap();
        let again = engine.process_vote("a", "r1", "x", VoteKind::Like).await;

        assert!(matches!(again, Err(VoteError::AlreadyVoted { .. })));
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_negative_votes_never_match() {
        let users = ["a", "b", "c"];
        let (engine, _) = setup(3, &users).await;

        for user in users {
            let view = engine.process_vote(user, "r1", "x", VoteKind::Dislike).await.unwrap();
            assert_eq!(view.status, RoomStatus::Active);
        }

        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 0);
        assert!(engine.ledger().votes_in("r1").await.unwrap().is_empty());
        // Still recorded as shown
        assert!(engine.rooms().shown_items("r1").await.unwrap().contains("x"));
    }

    #[tokio::test]
    async fn test_validation_order() {
        let (engine, _) = setup(2, &["a"]).await;

        let missing = engine.process_vote("a", "nope", "x", VoteKind::Like).await;
        assert!(matches!(missing, Err(VoteError::RoomNotVotable(_))));

        let stranger = engine.process_vote("z", "r1", "x", VoteKind::Like).await;
        assert!(matches!(stranger, Err(VoteError::NotAMember { .. })));

        engine.rooms().leave_room("r1", "a").await.unwrap();
        let inactive = engine.process_vote("a", "r1", "x", VoteKind::Like).await;
        assert!(matches!(inactive, Err(VoteError::NotAMember { .. })));

    }

    #[tokio::test]
    async fn test_completed_room_rejects_votes() {
        let store = Arc::new(MemoryStore::new());
        let engine = ConsensusEngine::new(
            store.clone(),
            Arc::new(ChannelPublisher::default()),
            fast_config(),
        );
        let room = Room {
            status: RoomStatus::Completed,
            ..Room::new("r1", 2)
        };
        store
            .put(
                &keys::room("r1"),
                serde_json::to_value(&room).unwrap(),
                Condition::Absent,
            )
            .await
            .unwrap();
        engine.rooms().join_room("r1", "a").await.unwrap();

        let closed = engine.process_vote("a", "r1", "x", VoteKind::Like).await;
        assert!(matches!(closed, Err(VoteError::RoomNotVotable(_))));
        assert!(engine.ledger().votes_in("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_room_accepts_votes() {
        let publisher = ChannelPublisher::default();
        let engine = ConsensusEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(publisher),
            fast_config(),
        );
        engine.rooms().create_room("r1", 1).await.unwrap();
        engine.rooms().join_room("r1", "solo").await.unwrap();

        let view = engine.process_vote("solo", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(view.status, RoomStatus::Matched);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_match_exactly_once() {
        let users: Vec<String> = (0..12).map(|i| format!("u{}", i)).collect();
        let user_refs: Vec<&str> = users.iter().map(String::as_str).collect();
        let (engine, publisher) = setup(4, &user_refs).await;
        let mut events = publisher.subscribe();

        let mut tasks = Vec::new();
        for user in &users {
            for item in ["x", "y", "z"] {
                let engine = engine.clone();
                let user = user.clone();
                tasks.push(tokio::spawn(async move {
                    engine.process_vote(&user, "r1", item, VoteKind::Like).await
                }));
            }
        }
        for result in join_all(tasks).await {
            let view = result.unwrap().unwrap();
            assert!(matches!(view.status, RoomStatus::Active | RoomStatus::Matched));
        }

        let room = engine.rooms().get_room("r1").await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Matched);
        let winner = room.result_item_id.clone().unwrap();

        // Aggregates equal the vote records for every item
        let votes = engine.ledger().votes_in("r1").await.unwrap();
        for tally in engine.aggregates().tallies("r1").await.unwrap() {
            let recorded = votes.iter().filter(|v| v.item_id == tally.item_id).count() as u64;
            assert_eq!(tally.count, recorded, "item {}", tally.item_id);
        }
        assert!(engine.aggregates().count("r1", &winner).await.unwrap() >= 4);

        let mut matches = 0;
        while let Ok(event) = events.try_recv() {
            if let RoomEvent::Matched(m) = event {
                assert_eq!(m.item_id, winner);
                matches += 1;
            }
        }
        assert_eq!(matches, 1);
    }

    /// Store wrapper failing the first N calls of chosen operations
    struct ScriptedStore {
        inner: MemoryStore,
        faults: Vec<(&'static str, AtomicU32)>,
    }

    impl ScriptedStore {
        fn new(operation: &'static str, failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                faults: vec![(operation, AtomicU32::new(failures))],
            }
        }

        fn with_fault(mut self, operation: &'static str, failures: u32) -> Self {
            self.faults.push((operation, AtomicU32::new(failures)));
            self
        }

        fn fault(&self, operation: &str) -> StoreResult<()> {
            let tripped = self.faults.iter().any(|(op, failures)| {
                *op == operation
                    && failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
            });
            if tripped {
                return Err(StoreError::Throttled);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStore for ScriptedStore {
        async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
            self.fault("get")?;
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Value, condition: Condition) -> StoreResult<()> {
            self.fault("put")?;
            self.inner.put(key, value, condition).await
        }

        async fn update(&self, key: &str, fields: Map<String, Value>, condition: Condition) -> StoreResult<Value> {
            self.fault("update")?;
            self.inner.update(key, fields, condition).await
        }

        async fn increment(
            &self,
            key: &str,
            field: &str,
            delta: i64,
            set: Map<String, Value>,
            condition: Condition,
        ) -> StoreResult<i64> {
            self.fault("increment")?;
            self.inner.increment(key, field, delta, set, condition).await
        }

        async fn add_to_set(&self, key: &str, field: &str, member: Value) -> StoreResult<()> {
            self.fault("add_to_set")?;
            self.inner.add_to_set(key, field, member).await
        }

        async fn delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
            self.fault("delete")?;
            self.inner.delete(key, condition).await
        }

        async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
            self.fault("scan_prefix")?;
            self.inner.scan_prefix(prefix).await
        }
    }

    async fn scripted_engine(store: Arc<ScriptedStore>) -> ConsensusEngine {
        let engine = ConsensusEngine::new(store, Arc::new(ChannelPublisher::default()), fast_config());
        engine.rooms().create_room("r1", 2).await.unwrap();
        engine.rooms().join_room("r1", "a").await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_transient_faults_are_retried() {
        let store = Arc::new(ScriptedStore::new("increment", 2));
        let engine = scripted_engine(store).await;

        let view = engine.process_vote("a", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(view.status, RoomStatus::Waiting);
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_tally_retracts_vote() {
        let store = Arc::new(ScriptedStore::new("increment", 4));
        let engine = scripted_engine(store.clone()).await;

        let failed = engine.process_vote("a", "r1", "x", VoteKind::Like).await;
        match failed {
            Err(e) => assert!(e.is_retryable()),
            Ok(view) => panic!("unexpected success: {view:?}"),
        }
        assert!(!engine.ledger().exists("r1", "a", "x").await.unwrap());
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 0);

        // Faults spent: the same vote now goes through
        engine.process_vote("a", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_retract_leaves_record_blocking_resubmit() {
        let store = Arc::new(ScriptedStore::new("increment", 4).with_fault("delete", 4));
        let engine = scripted_engine(store.clone()).await;

        let failed = engine.process_vote("a", "r1", "x", VoteKind::Like).await;
        assert!(matches!(failed, Err(VoteError::InfrastructureUnavailable { .. })));

        // The record survives without a tally until it is repaired
        assert!(engine.ledger().exists("r1", "a", "x").await.unwrap());
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 0);
        let again = engine.process_vote("a", "r1", "x", VoteKind::Like).await;
        assert!(matches!(again, Err(VoteError::AlreadyVoted { .. })));

        // Repair: drop the orphan, then the vote goes through
        let orphan = VoteRecord::new("r1", "a", "x", VoteKind::Like);
        engine.ledger().retract(&orphan).await.unwrap();
        engine.process_vote("a", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shown_marker_failure_is_not_fatal() {
        let store = Arc::new(ScriptedStore::new("add_to_set", 10));
        let engine = scripted_engine(store).await;

        engine.process_vote("a", "r1", "x", VoteKind::Like).await.unwrap();
        assert_eq!(engine.aggregates().count("r1", "x").await.unwrap(), 1);
    }
}
