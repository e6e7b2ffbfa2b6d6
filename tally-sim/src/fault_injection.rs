//! Fault injection for consensus testing
//!
//! Provides mechanisms to inject transient infrastructure faults:
//! - Throttling responses
//! - Service-unavailable responses
//! - Store latency
//!
//! Faults are raised before the wrapped call runs, so a failed call never
//! has a side effect. Lost responses are out of scope.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tally_core::{Condition, ConsensusEngine, KeyValueStore, StoreError, StoreResult, VoteKind};
use tally_queue::{ExecResult, ExecutorError, OperationExecutor};
use tracing::debug;
use uuid::Uuid;

/// Fault injection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
    /// Probability that a store call fails (0.0-1.0)
    pub error_rate: f64,
    /// Share of failures reported as unavailable rather than throttled
    pub unavailable_share: f64,
    /// Minimum store latency in milliseconds (0 = no delay)
    pub min_delay_ms: u64,
    /// Maximum store latency in milliseconds
    pub max_delay_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            unavailable_share: 0.5,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl FaultConfig {
    /// No faults (happy path)
    pub fn none() -> Self {
        Self::default()
    }

    /// Light faults (5% of calls fail)
    pub fn light() -> Self {
        Self {
            error_rate: 0.05,
            ..Default::default()
        }
    }

    /// Heavy faults (20% of calls fail, 1-5ms latency)
    pub fn heavy() -> Self {
        Self {
            error_rate: 0.20,
            min_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        }
    }

    /// Slow store (1-10ms latency, no errors)
    pub fn slow_store() -> Self {
        Self {
            min_delay_ms: 1,
            max_delay_ms: 10,
            ..Default::default()
        }
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    pub fn delays_enabled(&self) -> bool {
        self.max_delay_ms > 0
    }
}

/// Counts of injected faults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FaultStats {
    pub calls: u64,
    pub throttled: u64,
    pub unavailable: u64,
}

/// Random decisions shared by every wrapped call
struct FaultInjector {
    config: FaultConfig,
    rng: Mutex<StdRng>,
    calls: AtomicU64,
    throttled: AtomicU64,
    unavailable: AtomicU64,
}

impl FaultInjector {
    fn new(config: FaultConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            calls: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            unavailable: AtomicU64::new(0),
        }
    }

    /// Decide latency and failure for one call
    fn roll(&self, operation: &str) -> (Option<Duration>, Option<StoreError>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut rng = self.rng.lock();

        let delay = if self.config.delays_enabled() {
            let ms = rng.gen_range(self.config.min_delay_ms..=self.config.max_delay_ms);
            Some(Duration::from_millis(ms))
        } else {
            None
        };

        if rng.gen::<f64>() >= self.config.error_rate {
            return (delay, None);
        }

        let error = if rng.gen::<f64>() < self.config.unavailable_share {
            self.unavailable.fetch_add(1, Ordering::Relaxed);
            StoreError::Unavailable(format!("injected fault in {}", operation))
        } else {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            StoreError::Throttled
        };
        debug!("Faults: Injected {} into {}", error, operation);
        (delay, Some(error))
    }

    fn stats(&self) -> FaultStats {
        FaultStats {
            calls: self.calls.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
        }
    }
}

/// Store wrapper that injects transient faults
pub struct FlakyStore<S> {
    inner: S,
    injector: FaultInjector,
}

impl<S: KeyValueStore> FlakyStore<S> {
    pub fn new(inner: S, config: FaultConfig, seed: u64) -> Self {
        Self {
            inner,
            injector: FaultInjector::new(config, seed),
        }
    }

    pub fn stats(&self) -> FaultStats {
        self.injector.stats()
    }

    async fn fault(&self, operation: &str) -> StoreResult<()> {
        let (delay, error) = self.injector.roll(operation);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for FlakyStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.fault("get").await?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Value, condition: Condition) -> StoreResult<()> {
        self.fault("put").await?;
        self.inner.put(key, value, condition).await
    }

    async fn update(
        &self,
        key: &str,
        fields: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<Value> {
        self.fault("update").await?;
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
        self.fault("increment").await?;
        self.inner.increment(key, field, delta, set, condition).await
    }

    async fn add_to_set(&self, key: &str, field: &str, member: Value) -> StoreResult<()> {
        self.fault("add_to_set").await?;
        self.inner.add_to_set(key, field, member).await
    }

    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        self.fault("delete").await?;
        self.inner.delete(key, condition).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        self.fault("scan_prefix").await?;
        self.inner.scan_prefix(prefix).await
    }
}

/// Device-side executor that talks to an engine through a flaky link
pub struct EngineExecutor {
    engine: ConsensusEngine,
    user_id: String,
    injector: FaultInjector,
}

impl EngineExecutor {
    pub fn new(engine: ConsensusEngine, user_id: impl Into<String>, link: FaultConfig, seed: u64) -> Self {
        Self {
            engine,
            user_id: user_id.into(),
            injector: FaultInjector::new(link, seed),
        }
    }

    pub fn link_stats(&self) -> FaultStats {
        self.injector.stats()
    }

    async fn link(&self, operation: &str) -> Result<(), ExecutorError> {
        let (delay, error) = self.injector.roll(operation);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(e) => Err(ExecutorError::Transient(e.to_string())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OperationExecutor for EngineExecutor {
    async fn vote(&self, room_id: &str, item_id: &str, kind: VoteKind) -> ExecResult {
        self.link("vote").await?;
        let view = self
            .engine
            .process_vote(&self.user_id, room_id, item_id, kind)
            .await?;
        serde_json::to_value(view).map_err(|e| ExecutorError::Business(e.to_string()))
    }

    async fn join_room(&self, room_id: &str) -> ExecResult {
        self.link("join room").await?;
        let membership = self.engine.rooms().join_room(room_id, &self.user_id).await?;
        serde_json::to_value(membership).map_err(|e| ExecutorError::Business(e.to_string()))
    }

    async fn create_room(&self, capacity: u32, name: Option<&str>) -> ExecResult {
        self.link("create room").await?;
        let room_id = Uuid::new_v4().to_string();
        let room = self.engine.rooms().create_room(&room_id, capacity).await?;
        self.engine.rooms().join_room(&room_id, &self.user_id).await?;
        debug!("Faults: Created room {} ({:?})", room_id, name);
        serde_json::to_value(room).map_err(|e| ExecutorError::Business(e.to_string()))
    }

    async fn leave_room(&self, room_id: &str) -> ExecResult {
        self.link("leave room").await?;
        self.engine.rooms().leave_room(room_id, &self.user_id).await?;
        Ok(json!({ "roomId": room_id, "left": true }))
    }

    async fn update_filters(&self, room_id: &str, filters: &Value) -> ExecResult {
        self.link("update filters").await?;
        // Filters only shape recommendations, which live upstream
        Ok(json!({ "roomId": room_id, "filters": filters }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::MemoryStore;

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let store = FlakyStore::new(MemoryStore::new(), FaultConfig::none(), 7);
        store.put("k", json!({"a": 1}), Condition::Absent).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));

        let stats = store.stats();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.throttled + stats.unavailable, 0);
    }

    #[tokio::test]
    async fn test_failed_call_has_no_effect() {
        let store = FlakyStore::new(MemoryStore::new(), FaultConfig::none().with_error_rate(1.0), 7);
        let result = store.put("k", json!(1), Condition::Always).await;
        assert!(result.is_err());
        assert_eq!(store.inner.get("k").await.unwrap(), None);
    }

    #[test]
    fn test_fault_rate_roughly_honored() {
        let injector = FaultInjector::new(FaultConfig::light(), 42);
        for _ in 0..10_000 {
            injector.roll("get");
        }
        let stats = injector.stats();
        let failed = stats.throttled + stats.unavailable;
        assert!((300..=700).contains(&failed), "failed = {}", failed);
    }
}
