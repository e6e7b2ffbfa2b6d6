//! Durable, priority-ordered offline operation queue
//!
//! Implements:
//! - Execute-or-queue: run immediately when online, otherwise defer
//! - Drain passes in priority order, FIFO within a tier
//! - Retry counting, expiry and capacity eviction
//! - Full-document persistence on every mutation, reloaded on open
//!
//! Mutations are serialized behind one async lock that is held while the
//! new document is persisted. Executors run outside that lock; an in-flight
//! set keeps concurrent drain passes from picking up the same operation.

use crate::config::{EnqueueOptions, QueueConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ExecutorError, QueueResult};
use crate::operation::{Operation, OperationType, Priority, QueuedOperation};
use crate::persist::QueueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tally_core::VoteKind;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one executor call
pub type ExecResult = Result<Value, ExecutorError>;

/// Client-side executors, one per operation type
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn vote(&self, room_id: &str, item_id: &str, kind: VoteKind) -> ExecResult;

    async fn join_room(&self, room_id: &str) -> ExecResult;

    async fn create_room(&self, capacity: u32, name: Option<&str>) -> ExecResult;

    async fn leave_room(&self, room_id: &str) -> ExecResult;

    async fn update_filters(&self, room_id: &str, filters: &Value) -> ExecResult;

    /// Dispatch to the executor for the operation's type
    async fn execute(&self, operation: &Operation) -> ExecResult {
        match operation {
            Operation::Vote {
                room_id,
                item_id,
                kind,
            } => self.vote(room_id, item_id, *kind).await,
            Operation::JoinRoom { room_id } => self.join_room(room_id).await,
            Operation::CreateRoom { capacity, name } => {
                self.create_room(*capacity, name.as_deref()).await
            }
            Operation::LeaveRoom { room_id } => self.leave_room(room_id).await,
            Operation::UpdateFilters { room_id, filters } => {
                self.update_filters(room_id, filters).await
            }
        }
    }
}

/// Result handed back to the caller of `execute_or_queue`
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Executed directly; carries the executor's result
    Executed(Value),
    /// Deferred; treat as optimistic success
    Queued { id: Uuid },
}

impl Submission {
    pub fn from_queue(&self) -> bool {
        matches!(self, Submission::Queued { .. })
    }
}

/// Why an operation left the queue without succeeding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropReason {
    ExhaustedRetries,
    Expired,
    Evicted,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::ExhaustedRetries => write!(f, "retries exhausted"),
            DropReason::Expired => write!(f, "expired"),
            DropReason::Evicted => write!(f, "evicted"),
        }
    }
}

/// Queue lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Completed { id: Uuid, kind: OperationType },
    Dropped {
        id: Uuid,
        kind: OperationType,
        reason: DropReason,
    },
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub expired: usize,
    /// Already claimed by a concurrent pass or removed meanwhile
    pub skipped: usize,
}

/// Releases an in-flight claim when dropped
struct Claim<'a> {
    in_flight: &'a parking_lot::Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

/// Offline operation queue
pub struct OperationQueue {
    config: QueueConfig,
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn OperationExecutor>,
    connectivity: ConnectivityMonitor,
    operations: Mutex<Vec<QueuedOperation>>,
    in_flight: parking_lot::Mutex<HashSet<Uuid>>,
    events: broadcast::Sender<QueueEvent>,
}

impl OperationQueue {
    /// Reconstruct the queue from storage
    pub async fn open(
        config: QueueConfig,
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn OperationExecutor>,
        connectivity: ConnectivityMonitor,
    ) -> QueueResult<Self> {
        let operations = Self::load(&config, store.as_ref()).await?;
        info!(
            "Queue: Opened with {} pending operations (max {})",
            operations.len(),
            config.max_queue_size
        );

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            config,
            store,
            executor,
            connectivity,
            operations: Mutex::new(operations),
            in_flight: parking_lot::Mutex::new(HashSet::new()),
            events,
        })
    }

    async fn load(config: &QueueConfig, store: &dyn QueueStore) -> QueueResult<Vec<QueuedOperation>> {
        let Some(document) = store.load(&config.storage_key).await? else {
            return Ok(Vec::new());
        };

        let records: Vec<Value> = match serde_json::from_str(&document) {
            Ok(records) => records,
            Err(e) => {
                warn!("Queue: Discarding unreadable queue document: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut operations = Vec::with_capacity(records.len());
        for record in records {
            match QueuedOperation::from_value(record) {
                Ok(op) => operations.push(op),
                Err(e) => warn!("Queue: Dropping persisted operation: {}", e),
            }
        }
        Ok(operations)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Run the operation now if possible, otherwise queue it.
    ///
    /// Executor failures while online also fall back to queueing; the call
    /// only fails when the queue cannot persist.
    pub async fn execute_or_queue(
        &self,
        operation: Operation,
        options: EnqueueOptions,
    ) -> QueueResult<Submission> {
        if self.connectivity.is_online() {
            match self.executor.execute(&operation).await {
                Ok(value) => return Ok(Submission::Executed(value)),
                Err(e) => warn!(
                    "Queue: Direct {} failed, queueing: {}",
                    operation.kind(),
                    e
                ),
            }
        } else {
            debug!("Queue: Offline, queueing {}", operation.kind());
        }

        let id = self.enqueue(operation, options).await?;
        Ok(Submission::Queued { id })
    }

    /// Add an operation without trying it first
    pub async fn enqueue(&self, operation: Operation, options: EnqueueOptions) -> QueueResult<Uuid> {
        let kind = operation.kind();
        let (priority, max_retries, expires_in) = options.resolve(kind, &self.config);
        let created_at = Utc::now();
        let queued = QueuedOperation {
            id: Uuid::new_v4(),
            operation,
            priority,
            retry_count: 0,
            max_retries,
            created_at,
            expires_at: expiry(created_at, expires_in),
        };
        let id = queued.id;

        let mut operations = self.operations.lock().await;
        let mut next = operations.clone();
        next.push(queued);
        let evicted = evict(&mut next, self.config.max_queue_size);
        self.persist(&mut operations, next).await?;
        drop(operations);

        info!("Queue: Queued {} {} ({})", kind, id, priority);
        for op in evicted {
            warn!("Queue: Evicted {} {} ({})", op.kind(), op.id, op.priority);
            self.emit_dropped(&op, DropReason::Evicted);
        }
        Ok(id)
    }

    /// Replace the live list after the new document is stored
    async fn persist(
        &self,
        operations: &mut Vec<QueuedOperation>,
        next: Vec<QueuedOperation>,
    ) -> QueueResult<()> {
        let document = serde_json::to_string(&next)?;
        self.store.save(&self.config.storage_key, &document).await?;
        *operations = next;
        Ok(())
    }

    /// Operations in drain order
    pub async fn pending(&self) -> Vec<QueuedOperation> {
        let mut snapshot = self.operations.lock().await.clone();
        snapshot.sort_by_key(|op| op.priority);
        snapshot
    }

    pub async fn len(&self) -> usize {
        self.operations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.operations.lock().await.is_empty()
    }

    /// Drop everything, e.g. on sign-out
    pub async fn clear(&self) -> QueueResult<()> {
        let mut operations = self.operations.lock().await;
        let count = operations.len();
        self.persist(&mut operations, Vec::new()).await?;
        info!("Queue: Cleared {} operations", count);
        Ok(())
    }

    /// Run one pass over a snapshot of the queue
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        let mut report = DrainReport::default();
        let batch = self.pending().await;
        if batch.is_empty() {
            return Ok(report);
        }
        debug!("Queue: Draining {} operations", batch.len());

        for op in batch {
            let Some(_claim) = self.claim(op.id) else {
                report.skipped += 1;
                continue;
            };

            // Another pass may have finished it between snapshot and claim
            let Some(current) = self.find(op.id).await else {
                report.skipped += 1;
                continue;
            };

            if current.is_expired(Utc::now()) {
                if self.remove(op.id).await?.is_some() {
                    info!("Queue: {} {} expired", current.kind(), op.id);
                    self.emit_dropped(&current, DropReason::Expired);
                    report.expired += 1;
                }
                continue;
            }

            report.attempted += 1;
            match self.executor.execute(&current.operation).await {
                // An operation evicted while in flight still lands upstream;
                // it is neither counted nor announced as completed.
                Ok(_) => match self.remove(op.id).await? {
                    Some(_) => {
                        debug!("Queue: {} {} succeeded", current.kind(), op.id);
                        let _ = self.events.send(QueueEvent::Completed {
                            id: op.id,
                            kind: current.kind(),
                        });
                        report.succeeded += 1;
                    }
                    None => debug!(
                        "Queue: {} {} finished after leaving the queue",
                        current.kind(),
                        op.id
                    ),
                },
                Err(e) => {
                    report.failed += 1;
                    match self.record_failure(op.id).await? {
                        Some((failed, reason)) => {
                            warn!(
                                "Queue: Dropping {} {} after {} attempts: {}",
                                failed.kind(),
                                op.id,
                                failed.retry_count,
                                e
                            );
                            self.emit_dropped(&failed, reason);
                            match reason {
                                DropReason::Expired => report.expired += 1,
                                _ => report.exhausted += 1,
                            }
                        }
                        None => debug!("Queue: {} {} failed, will retry: {}", current.kind(), op.id, e),
                    }
                }
            }
        }

        info!(
            "Queue: Drain pass done ({} ok, {} failed, {} dropped)",
            report.succeeded,
            report.failed,
            report.exhausted + report.expired
        );
        Ok(report)
    }

    fn claim(&self, id: Uuid) -> Option<Claim<'_>> {
        if self.in_flight.lock().insert(id) {
            Some(Claim {
                in_flight: &self.in_flight,
                id,
            })
        } else {
            None
        }
    }

    async fn find(&self, id: Uuid) -> Option<QueuedOperation> {
        self.operations.lock().await.iter().find(|op| op.id == id).cloned()
    }

    async fn remove(&self, id: Uuid) -> QueueResult<Option<QueuedOperation>> {
        let mut operations = self.operations.lock().await;
        let Some(index) = operations.iter().position(|op| op.id == id) else {
            return Ok(None);
        };
        let mut next = operations.clone();
        let removed = next.remove(index);
        self.persist(&mut operations, next).await?;
        Ok(Some(removed))
    }

    /// Bump the retry count; returns the operation if it was removed
    async fn record_failure(&self, id: Uuid) -> QueueResult<Option<(QueuedOperation, DropReason)>> {
        let mut operations = self.operations.lock().await;
        let Some(index) = operations.iter().position(|op| op.id == id) else {
            return Ok(None);
        };

        let mut next = operations.clone();
        next[index].retry_count += 1;
        let op = &next[index];
        let reason = if op.retries_exhausted() {
            Some(DropReason::ExhaustedRetries)
        } else if op.is_expired(Utc::now()) {
            Some(DropReason::Expired)
        } else {
            None
        };

        let dropped = reason.map(|reason| (next.remove(index), reason));
        self.persist(&mut operations, next).await?;
        Ok(dropped)
    }

    fn emit_dropped(&self, op: &QueuedOperation, reason: DropReason) {
        // No subscribers is fine
        let _ = self.events.send(QueueEvent::Dropped {
            id: op.id,
            kind: op.kind(),
            reason,
        });
    }
}

fn expiry(created_at: DateTime<Utc>, expires_in: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expires_in)
        .ok()
        .and_then(|d| created_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Trim to capacity: oldest LOW first, then MEDIUM, HIGH only as a last resort
fn evict(operations: &mut Vec<QueuedOperation>, max_queue_size: usize) -> Vec<QueuedOperation> {
    let mut evicted = Vec::new();
    while operations.len() > max_queue_size {
        let victim = Priority::EVICTION_ORDER.iter().find_map(|tier| {
            operations
                .iter()
                .enumerate()
                .filter(|(_, op)| op.priority == *tier)
                .min_by_key(|(_, op)| op.created_at)
                .map(|(index, _)| index)
        });
        match victim {
            Some(index) => evicted.push(operations.remove(index)),
            None => break,
        }
    }
    evicted
}

/// Drain on every offline-to-online transition and on a fixed interval
/// while online, until `shutdown` flips.
pub fn spawn_drain_loop(
    queue: Arc<OperationQueue>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut connectivity = queue.connectivity().subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(queue.config().drain_interval);
        info!(
            "Queue: Drain loop started ({:?} interval)",
            queue.config().drain_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !queue.connectivity().is_online() {
                        continue;
                    }
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*connectivity.borrow_and_update() {
                        continue;
                    }
                    debug!("Queue: Back online, draining");
                }
                _ = shutdown.changed() => break,
            }

            if let Err(e) = queue.drain().await {
                warn!("Queue: Drain pass failed: {}", e);
            }
        }

        info!("Queue: Drain loop stopped");
    })
}
