//! Tally Queue Library
//!
//! Device-side queue that defers app operations while the device is offline
//! or the server is unreachable, and drains them in priority order once
//! connectivity returns.

pub mod error;
pub mod operation;
pub mod config;
pub mod persist;
pub mod connectivity;
pub mod queue;

pub use error::{ExecutorError, QueueError, QueueResult};
pub use operation::{Operation, OperationType, Priority, QueuedOperation};
pub use config::{EnqueueOptions, QueueConfig};
pub use persist::{FileQueueStore, MemoryQueueStore, QueueStore};
pub use connectivity::ConnectivityMonitor;
pub use queue::{
    spawn_drain_loop, DrainReport, DropReason, ExecResult, OperationExecutor, OperationQueue,
    QueueEvent, Submission,
};
