//! Durable storage for the queue
//!
//! The queue is persisted as one document under one key, fully replaced on
//! every mutation. Back-ends only move strings; encoding lives in the queue.

use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Key-value document storage
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self, key: &str) -> QueueResult<Option<String>>;

    async fn save(&self, key: &str, document: &str) -> QueueResult<()>;
}

/// One JSON file per key, replaced atomically via temp file + rename
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    dir: PathBuf,
}

impl FileQueueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self, key: &str) -> QueueResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, document: &str) -> QueueResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(document.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| QueueError::Persistence(format!("{:?}: {}", path, e)))?;
        debug!("Queue: Persisted {} bytes to {:?}", document.len(), path);
        Ok(())
    }
}

/// Volatile storage for tests and the simulator
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw document currently stored under `key`
    pub fn document(&self, key: &str) -> Option<String> {
        self.documents.lock().get(key).cloned()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self, key: &str) -> QueueResult<Option<String>> {
        Ok(self.documents.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, document: &str) -> QueueResult<()> {
        self.documents.lock().insert(key.to_string(), document.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_replaces_document() {
        let dir = tempdir().unwrap();
        let store = FileQueueStore::new(dir.path().join("queue"));

        assert!(store.load("tally.offline_queue").await.unwrap().is_none());

        store.save("tally.offline_queue", "[1]").await.unwrap();
        store.save("tally.offline_queue", "[1,2]").await.unwrap();

        assert_eq!(
            store.load("tally.offline_queue").await.unwrap().as_deref(),
            Some("[1,2]")
        );
        assert!(!dir.path().join("queue/tally.offline_queue.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_keys_are_sanitized() {
        let dir = tempdir().unwrap();
        let store = FileQueueStore::new(dir.path());

        store.save("user/42:queue", "[]").await.unwrap();
        assert!(dir.path().join("user_42_queue.json").exists());
        assert_eq!(store.load("user/42:queue").await.unwrap().as_deref(), Some("[]"));
    }
}
