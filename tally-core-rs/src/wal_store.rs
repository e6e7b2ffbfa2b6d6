//! Write-ahead-logged keyed store.
//!
//! Implements:
//! - One JSON line per applied mutation
//! - Replay on open (snapshot first, then WAL)
//! - Snapshot + WAL compaction past a configurable entry count
//!
//! Conditions are evaluated before logging, so only mutations that actually
//! took effect reach the log and replay never re-checks them.

use crate::error::{StoreError, StoreResult};
use crate::store::{numeric_field, Condition, KeyValueStore, Mutation, Table};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const WAL_FILE: &str = "wal.log";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// WAL store configuration
#[derive(Debug, Clone)]
pub struct WalStoreConfig {
    /// Base directory for storage files
    pub dir: PathBuf,
    /// Flush to disk after every write
    pub fsync_on_write: bool,
    /// WAL entries before a snapshot is taken
    pub snapshot_threshold: usize,
}

impl Default for WalStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tally-data"),
            fsync_on_write: true,
            snapshot_threshold: 1000,
        }
    }
}

impl WalStoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_snapshot_threshold(mut self, threshold: usize) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_fsync(mut self, fsync_on_write: bool) -> Self {
        self.fsync_on_write = fsync_on_write;
        self
    }
}

struct WalState {
    table: Table,
    wal: BufWriter<File>,
    entries_since_snapshot: usize,
}

/// Durable store backed by a local write-ahead log
pub struct WalStore {
    config: WalStoreConfig,
    state: Mutex<WalState>,
}

impl WalStore {
    /// Open (or create) the store and recover its contents
    pub fn open(config: WalStoreConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let (table, replayed) = Self::recover(&config)?;
        let mut wal = Self::open_wal(&config)?;
        if Self::has_torn_tail(&config)? {
            writeln!(wal)?;
            wal.flush()?;
        }

        info!(
            "Store: Opened WAL store at {:?} ({} records, {} entries replayed)",
            config.dir,
            table.len(),
            replayed
        );

        Ok(Self {
            config,
            state: Mutex::new(WalState {
                table,
                wal,
                entries_since_snapshot: replayed,
            }),
        })
    }

    fn open_wal(config: &WalStoreConfig) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.dir.join(WAL_FILE))?;
        Ok(BufWriter::new(file))
    }

    /// True when the last WAL line was cut short by a crash
    fn has_torn_tail(config: &WalStoreConfig) -> io::Result<bool> {
        let data = match fs::read(config.dir.join(WAL_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(data.last().map(|b| *b != b'\n').unwrap_or(false))
    }

    fn recover(config: &WalStoreConfig) -> io::Result<(Table, usize)> {
        let mut table = Table::new();

        let snapshot_path = config.dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let data = fs::read_to_string(&snapshot_path)?;
            match serde_json::from_str::<Table>(&data) {
                Ok(snap) => {
                    debug!("Store: Loaded snapshot with {} records", snap.len());
                    table = snap;
                }
                Err(e) => warn!("Store: Failed to parse snapshot: {}", e),
            }
        }

        let mut replayed = 0;
        let wal_path = config.dir.join(WAL_FILE);
        if wal_path.exists() {
            let reader = BufReader::new(File::open(&wal_path)?);
            for (line_num, line) in reader.lines().enumerate() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("Store: WAL read error at line {}: {}", line_num + 1, e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Mutation>(&line) {
                    Ok(mutation) => {
                        if let Err(e) = table.apply(&mutation) {
                            warn!("Store: WAL entry {} could not be applied: {}", line_num + 1, e);
                        }
                        replayed += 1;
                    }
                    // A torn final line after a crash is expected; skip it
                    Err(e) => warn!("Store: WAL parse error at line {}: {}", line_num + 1, e),
                }
            }
        }

        Ok((table, replayed))
    }

    fn mutate(&self, condition: &Condition, mutation: Mutation) -> StoreResult<Option<Value>> {
        let mut state = self.state.lock();

        // Dry-run on a scratch copy of the single record keeps a failed
        // write out of both the table and the log.
        let mut scratch = Table::new();
        if let Some(current) = state.table.get(mutation.key()) {
            scratch.apply(&Mutation::Put {
                key: mutation.key().to_string(),
                value: current.clone(),
            })?;
        }
        let result = scratch.apply_if(condition, &mutation)?;

        let line = serde_json::to_string(&mutation)?;
        writeln!(state.wal, "{}", line)?;
        if self.config.fsync_on_write {
            state.wal.flush()?;
            state.wal.get_ref().sync_data()?;
        }
        state.table.apply(&mutation)?;
        state.entries_since_snapshot += 1;

        // The write is durable and applied at this point; a failed compaction
        // must not surface as a retryable error or the caller re-applies it.
        // The counter stays past the threshold so the next write tries again.
        if state.entries_since_snapshot >= self.config.snapshot_threshold {
            if let Err(e) = self.snapshot(&mut state) {
                warn!("Store: Snapshot failed: {}", e);
            }
        }

        Ok(result)
    }

    /// Write a snapshot then truncate the WAL
    fn snapshot(&self, state: &mut WalState) -> StoreResult<()> {
        state.wal.flush()?;

        let snapshot_path = self.config.dir.join(SNAPSHOT_FILE);
        let temp_path = self.config.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        fs::write(&temp_path, serde_json::to_vec(&state.table)?)?;
        fs::rename(&temp_path, &snapshot_path)?;

        let wal_path = self.config.dir.join(WAL_FILE);
        File::create(&wal_path)?;
        state.wal = Self::open_wal(&self.config)?;
        state.entries_since_snapshot = 0;

        info!("Store: Snapshot written ({} records), WAL compacted", state.table.len());
        Ok(())
    }

    /// Force a snapshot regardless of the threshold
    pub fn checkpoint(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        self.snapshot(&mut state)
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for WalStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.state.lock().table.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value, condition: Condition) -> StoreResult<()> {
        let mutation = Mutation::Put {
            key: key.to_string(),
            value,
        };
        self.mutate(&condition, mutation).map(|_| ())
    }

    async fn update(
        &self,
        key: &str,
        fields: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<Value> {
        let mutation = Mutation::Update {
            key: key.to_string(),
            fields,
        };
        self.mutate(&condition, mutation)?
            .ok_or_else(|| StoreError::Internal(format!("update of {} produced no record", key)))
    }

    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        set: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<i64> {
        let mutation = Mutation::Increment {
            key: key.to_string(),
            field: field.to_string(),
            delta,
            set,
        };
        numeric_field(self.mutate(&condition, mutation)?, field)
    }

    async fn add_to_set(&self, key: &str, field: &str, member: Value) -> StoreResult<()> {
        let mutation = Mutation::AddToSet {
            key: key.to_string(),
            field: field.to_string(),
            member,
        };
        self.mutate(&Condition::Always, mutation).map(|_| ())
    }

    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        let mutation = Mutation::Delete {
            key: key.to_string(),
        };
        self.mutate(&condition, mutation).map(|_| ())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        Ok(self.state.lock().table.scan_prefix(prefix))
    }
}
