//! Predefined simulation scenarios
//!
//! Provides ready-to-run scenarios that combine:
//! - Room and voter setup
//! - A randomized ballot plan per voter
//! - Store fault injection
//! - Invariant checks once every voter has finished

use crate::checker::{check_room, RoomReport};
use crate::fault_injection::{EngineExecutor, FaultConfig, FaultStats, FlakyStore};
use crate::metrics::Metrics;
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_core::{
    ChannelPublisher, ConsensusEngine, EngineConfig, KeyValueStore, LogPublisher, MatchEvent,
    MemoryStore, RetryPolicy, RoomEvent, RoomStatus, VoteError, VoteKind, WalStore,
    WalStoreConfig,
};
use tally_queue::{
    ConnectivityMonitor, DrainReport, EnqueueOptions, MemoryQueueStore, Operation,
    OperationQueue, QueueConfig, QueueError, QueueEvent,
};
use thiserror::Error;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors from scenario execution
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Setup failed: {0}")]
    Setup(#[from] VoteError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Voter task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scenario configuration
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub name: String,
    pub description: String,
    pub fault: FaultConfig,
    pub rooms: usize,
    pub voters_per_room: usize,
    pub items: usize,
    pub quorum: u32,
    /// Share of ballots cast as dislikes
    pub dislike_rate: f64,
    /// Share of ballots submitted twice
    pub duplicate_rate: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "happy".to_string(),
            description: "No faults - baseline run".to_string(),
            fault: FaultConfig::none(),
            rooms: 4,
            voters_per_room: 5,
            items: 6,
            quorum: 3,
            dislike_rate: 0.3,
            duplicate_rate: 0.0,
        }
    }
}

/// Knobs shared by every scenario
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seed: u64,
    /// Base delay of the engine's retry policy
    pub base_delay: Duration,
    /// Back the run with a WAL store in this directory instead of memory
    pub wal_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            base_delay: Duration::from_millis(5),
            wal_dir: None,
        }
    }
}

/// Scenario execution results
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResults {
    pub scenario: String,
    pub ballots: usize,
    pub rooms_matched: usize,
    pub duration_ms: u64,
    pub faults: FaultStats,
    pub outcomes: BTreeMap<String, u64>,
    pub rooms: Vec<RoomReport>,
    #[serde(skip)]
    pub metrics: Metrics,
}

impl ScenarioResults {
    pub fn violations(&self) -> usize {
        self.rooms.iter().map(|r| r.violations.len()).sum()
    }

    pub fn is_valid(&self) -> bool {
        self.violations() == 0
    }
}

/// Get a predefined scenario by name
pub fn get_scenario(name: &str) -> Result<ScenarioConfig, ScenarioError> {
    match name.to_lowercase().as_str() {
        "happy" | "none" => Ok(ScenarioConfig::default()),

        "flaky" => Ok(ScenarioConfig {
            name: "flaky".to_string(),
            description: "20% transient store faults with latency".to_string(),
            fault: FaultConfig::heavy(),
            ..Default::default()
        }),

        "contention" => Ok(ScenarioConfig {
            name: "contention".to_string(),
            description: "Many voters racing on few items".to_string(),
            fault: FaultConfig::slow_store(),
            rooms: 3,
            voters_per_room: 20,
            items: 2,
            quorum: 5,
            dislike_rate: 0.1,
            ..Default::default()
        }),

        "negative" => Ok(ScenarioConfig {
            name: "negative".to_string(),
            description: "Dislikes only - nothing may match".to_string(),
            dislike_rate: 1.0,
            ..Default::default()
        }),

        "duplicates" => Ok(ScenarioConfig {
            name: "duplicates".to_string(),
            description: "Half of all ballots resubmitted".to_string(),
            fault: FaultConfig::light(),
            duplicate_rate: 0.5,
            ..Default::default()
        }),

        _ => Err(ScenarioError::UnknownScenario(name.to_string())),
    }
}

/// List all available scenarios
pub fn list_scenarios() -> Vec<&'static str> {
    vec!["happy", "flaky", "contention", "negative", "duplicates"]
}

/// One planned `process_vote` call
#[derive(Debug, Clone)]
struct Ballot {
    room_id: String,
    user_id: String,
    item_id: String,
    kind: VoteKind,
}

fn plan_ballots(config: &ScenarioConfig, rooms: &[String], rng: &mut StdRng) -> Vec<Vec<Ballot>> {
    let mut plans = Vec::new();
    for room_id in rooms {
        for v in 0..config.voters_per_room {
            let user_id = format!("user-{}", v);
            let mut items: Vec<String> = (0..config.items).map(|i| format!("item-{}", i)).collect();
            items.shuffle(rng);

            let mut ballots = Vec::new();
            for item_id in items {
                let kind = if rng.gen::<f64>() < config.dislike_rate {
                    VoteKind::Dislike
                } else {
                    VoteKind::Like
                };
                let ballot = Ballot {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                    item_id,
                    kind,
                };
                if rng.gen::<f64>() < config.duplicate_rate {
                    ballots.push(ballot.clone());
                }
                ballots.push(ballot);
            }
            plans.push(ballots);
        }
    }
    plans
}

fn outcome_label(result: &Result<tally_core::RoomView, VoteError>) -> &'static str {
    match result {
        Ok(view) if view.status == RoomStatus::Matched => "matched_view",
        Ok(_) => "accepted",
        Err(VoteError::AlreadyVoted { .. }) => "duplicate",
        Err(VoteError::RoomNotVotable(_)) => "not_votable",
        Err(VoteError::NotAMember { .. }) => "not_member",
        Err(VoteError::InfrastructureUnavailable { .. }) => "unavailable",
        Err(VoteError::InvalidRecord(_)) => "invalid",
    }
}

fn open_base_store(options: &RunOptions) -> Result<Arc<dyn KeyValueStore>, ScenarioError> {
    Ok(match &options.wal_dir {
        Some(dir) => Arc::new(WalStore::open(WalStoreConfig::new(dir).with_fsync(false))?),
        None => Arc::new(MemoryStore::new()),
    })
}

/// Run a scenario and check its invariants
pub async fn run_scenario(
    config: &ScenarioConfig,
    options: &RunOptions,
) -> Result<ScenarioResults, ScenarioError> {
    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(options.seed);
    let run_id = Uuid::new_v4().simple().to_string();

    let base = open_base_store(options)?;
    let flaky = Arc::new(FlakyStore::new(base.clone(), config.fault.clone(), options.seed));
    // Setup and checks bypass the injected faults
    let admin = ConsensusEngine::new(base, Arc::new(LogPublisher), EngineConfig::default());

    let rooms: Vec<String> = (0..config.rooms)
        .map(|r| format!("{}-room-{}", &run_id[..8], r))
        .collect();
    for room_id in &rooms {
        admin.rooms().create_room(room_id, config.quorum).await?;
        admin.rooms().activate_room(room_id).await?;
        for v in 0..config.voters_per_room {
            admin.rooms().join_room(room_id, &format!("user-{}", v)).await?;
        }
    }

    let plans = plan_ballots(config, &rooms, &mut rng);
    let ballots: usize = plans.iter().map(Vec::len).sum();
    info!(
        "Scenario: {} - {} rooms, {} voters, {} ballots",
        config.name,
        rooms.len(),
        plans.len(),
        ballots
    );

    let publisher = ChannelPublisher::new(ballots + 16);
    let mut events = publisher.subscribe();
    let engine = ConsensusEngine::new(
        flaky.clone(),
        Arc::new(publisher),
        EngineConfig::default().with_retry(RetryPolicy::new(3, options.base_delay)),
    );

    let tasks: Vec<_> = plans
        .into_iter()
        .map(|ballots| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut metrics = Metrics::new();
                for b in ballots {
                    let started = Instant::now();
                    let result = engine
                        .process_vote(&b.user_id, &b.room_id, &b.item_id, b.kind)
                        .await;
                    metrics.record(started.elapsed(), outcome_label(&result));
                }
                metrics
            })
        })
        .collect();

    let mut metrics = Metrics::new();
    for task in join_all(tasks).await {
        metrics.absorb(task?);
    }

    let mut matches: HashMap<String, Vec<MatchEvent>> = HashMap::new();
    loop {
        match events.try_recv() {
            Ok(RoomEvent::Matched(event)) => matches.entry(event.room_id.clone()).or_default().push(event),
            Ok(RoomEvent::Progress(_)) => {}
            Err(TryRecvError::Lagged(n)) => warn!("Scenario: Missed {} room events", n),
            Err(_) => break,
        }
    }

    let mut reports = Vec::with_capacity(rooms.len());
    for room_id in &rooms {
        let events = matches.remove(room_id).unwrap_or_default();
        let mut report = check_room(&admin, room_id, &events).await?;
        if report.status == Some(RoomStatus::Matched) && events.is_empty() {
            report.violations.push("MATCHED without a match event".into());
        }
        for violation in &report.violations {
            warn!("Scenario: {} violates: {}", room_id, violation);
        }
        reports.push(report);
    }

    let results = ScenarioResults {
        scenario: config.name.clone(),
        ballots,
        rooms_matched: reports
            .iter()
            .filter(|r| r.status == Some(RoomStatus::Matched))
            .count(),
        duration_ms: start.elapsed().as_millis() as u64,
        faults: flaky.stats(),
        outcomes: metrics.outcomes.clone(),
        rooms: reports,
        metrics,
    };

    info!(
        "Scenario: {} finished in {}ms - {} of {} rooms matched, {} violations",
        results.scenario,
        results.duration_ms,
        results.rooms_matched,
        config.rooms,
        results.violations()
    );
    Ok(results)
}

/// Offline queue scenario configuration
#[derive(Debug, Clone)]
pub struct QueueScenarioConfig {
    /// Votes queued while offline
    pub votes: usize,
    /// Faults on the device-to-server link
    pub link: FaultConfig,
    pub max_queue_size: usize,
    pub max_retries: u32,
    /// Drain passes before giving up on the remainder
    pub max_passes: usize,
}

impl Default for QueueScenarioConfig {
    fn default() -> Self {
        Self {
            votes: 12,
            link: FaultConfig::none().with_error_rate(0.3),
            max_queue_size: 100,
            max_retries: 3,
            max_passes: 10,
        }
    }
}

/// Offline queue scenario results
#[derive(Debug, Clone, Serialize)]
pub struct QueueScenarioResults {
    pub queued: usize,
    pub executed_directly: usize,
    pub passes: Vec<DrainReport>,
    pub completed: usize,
    pub dropped: BTreeMap<String, u64>,
    pub remaining: usize,
    pub room_status: Option<RoomStatus>,
    pub link_faults: FaultStats,
    pub duration_ms: u64,
}

/// Queue a session's worth of operations offline, reconnect and drain
pub async fn run_queue_scenario(
    config: &QueueScenarioConfig,
    options: &RunOptions,
) -> Result<QueueScenarioResults, ScenarioError> {
    let start = Instant::now();
    let engine = ConsensusEngine::new(
        open_base_store(options)?,
        Arc::new(LogPublisher),
        EngineConfig::default().with_retry(RetryPolicy::new(3, options.base_delay)),
    );

    // A peer has already liked item-0, so the device's like on it decides the room
    let room_id = format!("room-{}", &Uuid::new_v4().simple().to_string()[..8]);
    engine.rooms().create_room(&room_id, 2).await?;
    engine.rooms().activate_room(&room_id).await?;
    engine.rooms().join_room(&room_id, "peer").await?;
    engine
        .process_vote("peer", &room_id, "item-0", VoteKind::Like)
        .await?;

    let executor = Arc::new(EngineExecutor::new(
        engine.clone(),
        "device",
        config.link.clone(),
        options.seed,
    ));
    let connectivity = ConnectivityMonitor::new(false);
    let queue = OperationQueue::open(
        QueueConfig::default()
            .with_max_queue_size(config.max_queue_size)
            .with_max_retries(config.max_retries),
        Arc::new(MemoryQueueStore::new()),
        executor.clone(),
        connectivity.clone(),
    )
    .await?;
    let mut events = queue.subscribe();

    let mut operations = vec![Operation::JoinRoom {
        room_id: room_id.clone(),
    }];
    operations.extend((0..config.votes).map(|i| Operation::Vote {
        room_id: room_id.clone(),
        item_id: format!("item-{}", config.votes - 1 - i),
        kind: VoteKind::Like,
    }));
    operations.push(Operation::UpdateFilters {
        room_id: room_id.clone(),
        filters: json!({ "genres": ["comedy"], "maxRuntime": 120 }),
    });
    operations.push(Operation::CreateRoom {
        capacity: 4,
        name: Some("rematch".to_string()),
    });
    operations.push(Operation::LeaveRoom {
        room_id: room_id.clone(),
    });

    let mut queued = 0;
    let mut executed_directly = 0;
    for operation in operations {
        if queue
            .execute_or_queue(operation, EnqueueOptions::default())
            .await?
            .from_queue()
        {
            queued += 1;
        } else {
            executed_directly += 1;
        }
    }
    info!("Scenario: Queued {} operations while offline", queued);

    connectivity.set_online(true);
    let mut passes = Vec::new();
    while !queue.is_empty().await && passes.len() < config.max_passes {
        passes.push(queue.drain().await?);
    }

    let mut completed = 0;
    let mut dropped: BTreeMap<String, u64> = BTreeMap::new();
    loop {
        match events.try_recv() {
            Ok(QueueEvent::Completed { .. }) => completed += 1,
            Ok(QueueEvent::Dropped { reason, .. }) => {
                *dropped.entry(reason.to_string()).or_insert(0) += 1
            }
            Err(TryRecvError::Lagged(n)) => warn!("Scenario: Missed {} queue events", n),
            Err(_) => break,
        }
    }

    let results = QueueScenarioResults {
        queued,
        executed_directly,
        passes,
        completed,
        dropped,
        remaining: queue.len().await,
        room_status: engine.rooms().get_room(&room_id).await?.map(|r| r.status),
        link_faults: executor.link_stats(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        "Scenario: Queue drained in {} passes - {} completed, {} remaining",
        results.passes.len(),
        results.completed,
        results.remaining
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast() -> RunOptions {
        RunOptions {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_get_scenario() {
        for name in list_scenarios() {
            assert_eq!(get_scenario(name).unwrap().name, name);
        }
        assert!(matches!(
            get_scenario("partition"),
            Err(ScenarioError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_plan_is_seeded() {
        let config = get_scenario("duplicates").unwrap();
        let rooms = vec!["r".to_string()];
        let a = plan_ballots(&config, &rooms, &mut StdRng::seed_from_u64(1));
        let b = plan_ballots(&config, &rooms, &mut StdRng::seed_from_u64(1));

        let items = |plans: &Vec<Vec<Ballot>>| -> Vec<String> {
            plans.iter().flatten().map(|b| b.item_id.clone()).collect()
        };
        assert_eq!(items(&a), items(&b));
        assert!(a.iter().map(Vec::len).sum::<usize>() > config.voters_per_room * config.items);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_happy_scenario() {
        let config = get_scenario("happy").unwrap();
        let results = run_scenario(&config, &fast()).await.unwrap();

        assert!(results.is_valid(), "{:?}", results.rooms);
        assert!(results.rooms_matched > 0);
        assert_eq!(results.metrics.summary().total_calls, results.ballots);
        assert_eq!(results.faults.throttled + results.faults.unavailable, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_negative_scenario_never_matches() {
        let config = get_scenario("negative").unwrap();
        let results = run_scenario(&config, &fast()).await.unwrap();

        assert!(results.is_valid());
        assert_eq!(results.rooms_matched, 0);
        assert!(results.rooms.iter().all(|r| r.tallies.is_empty()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flaky_scenario_keeps_invariants() {
        let config = get_scenario("flaky").unwrap();
        let results = run_scenario(&config, &fast()).await.unwrap();

        assert!(results.is_valid(), "{:?}", results.rooms);
        assert!(results.faults.throttled + results.faults.unavailable > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_contention_on_wal_store() {
        let dir = tempdir().unwrap();
        let config = get_scenario("contention").unwrap();
        let options = RunOptions {
            wal_dir: Some(dir.path().to_path_buf()),
            ..fast()
        };
        let results = run_scenario(&config, &options).await.unwrap();

        assert!(results.is_valid(), "{:?}", results.rooms);
        assert_eq!(results.rooms_matched, config.rooms);
    }

    #[tokio::test]
    async fn test_queue_scenario_reliable_link() {
        let config = QueueScenarioConfig {
            link: FaultConfig::none(),
            ..Default::default()
        };
        let results = run_queue_scenario(&config, &fast()).await.unwrap();

        assert_eq!(results.executed_directly, 0);
        assert_eq!(results.queued, config.votes + 4);
        assert_eq!(results.remaining, 0);
        assert_eq!(results.passes.len(), 1);
        assert_eq!(results.room_status, Some(RoomStatus::Matched));
        // Votes after the match return the decided room and still count as done
        assert_eq!(results.completed, results.queued);
    }
}
