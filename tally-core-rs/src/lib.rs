//! Tally Core Library
//!
//! Stop-on-match voting for shared rooms. Votes are recorded once per
//! (room, user, item), tallied with atomic increments and the first item to
//! reach quorum wins through a single conditional MATCHED transition.

pub mod types;
pub mod error;
pub mod retry;
pub mod store;
pub mod wal_store;
pub mod rooms;
pub mod ledger;
pub mod events;
pub mod consensus;

pub use types::*;
pub use error::{Classify, ErrorClass, StoreError, StoreResult, VoteError};
pub use retry::{RetryError, RetryPolicy};
pub use store::{Condition, KeyValueStore, MemoryStore, Mutation};
pub use wal_store::{WalStore, WalStoreConfig};
pub use rooms::{MatchTransition, RoomDirectory};
pub use ledger::{AggregateCounter, VoteLedger};
pub use events::{ChannelPublisher, EventPublisher, LogPublisher, PublishError, RoomEvent};
pub use consensus::{ConsensusEngine, EngineConfig};
