//! Queue configuration

use crate::operation::{OperationType, Priority};
use std::time::Duration;

/// Default storage key for the persisted queue
pub const DEFAULT_STORAGE_KEY: &str = "tally.offline_queue";

/// Operation queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Capacity bound; overflow evicts by priority
    pub max_queue_size: usize,

    /// Failed drain attempts before an operation is dropped
    pub default_max_retries: u32,

    /// Lifetime of a queued operation
    pub default_expires_in: Duration,

    /// Period of the background drain loop
    pub drain_interval: Duration,

    /// Key the whole queue is persisted under
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            default_max_retries: 3,
            default_expires_in: Duration::from_secs(24 * 60 * 60),
            drain_interval: Duration::from_secs(30),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl QueueConfig {
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_expiry(mut self, expires_in: Duration) -> Self {
        self.default_expires_in = expires_in;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }
}

/// Per-call overrides for `execute_or_queue`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    pub max_retries: Option<u32>,
    pub expires_in: Option<Duration>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Fill unset fields from the queue defaults
    pub(crate) fn resolve(&self, kind: OperationType, config: &QueueConfig) -> (Priority, u32, Duration) {
        (
            self.priority.unwrap_or_else(|| kind.default_priority()),
            self.max_retries.unwrap_or(config.default_max_retries),
            self.expires_in.unwrap_or(config.default_expires_in),
        )
    }
}
