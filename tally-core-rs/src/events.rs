//! Room event publishing
//!
//! Progress and match notifications are fire-and-forget: publishers report
//! failures, but callers only log them.

use crate::types::{MatchEvent, RoomId, VoteProgress};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

/// Default capacity of the in-process broadcast channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("No subscribers for room events")]
    NoSubscribers,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Event delivered to room subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoomEvent {
    #[serde(rename = "VOTE_PROGRESS")]
    Progress(VoteProgress),

    #[serde(rename = "MATCH_FOUND")]
    Matched(MatchEvent),
}

impl RoomEvent {
    pub fn room_id(&self) -> &RoomId {
        match self {
            RoomEvent::Progress(p) => &p.room_id,
            RoomEvent::Matched(m) => &m.room_id,
        }
    }
}

/// Subscription fan-out collaborator
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_progress(&self, progress: &VoteProgress) -> Result<(), PublishError>;

    async fn publish_match(&self, event: &MatchEvent) -> Result<(), PublishError>;
}

/// Fallback publisher that only records events in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish_progress(&self, progress: &VoteProgress) -> Result<(), PublishError> {
        info!(
            room_id = %progress.room_id,
            item_id = %progress.item_id,
            count = progress.count,
            quorum = progress.quorum,
            "Events: VOTE_PROGRESS"
        );
        Ok(())
    }

    async fn publish_match(&self, event: &MatchEvent) -> Result<(), PublishError> {
        info!(
            room_id = %event.room_id,
            item_id = %event.item_id,
            participants = ?event.participants,
            "Events: MATCH_FOUND"
        );
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: broadcast::Sender<RoomEvent>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: RoomEvent) -> Result<(), PublishError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| PublishError::NoSubscribers)
    }
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish_progress(&self, progress: &VoteProgress) -> Result<(), PublishError> {
        self.send(RoomEvent::Progress(progress.clone()))
    }

    async fn publish_match(&self, event: &MatchEvent) -> Result<(), PublishError> {
        self.send(RoomEvent::Matched(event.clone()))
    }
}
