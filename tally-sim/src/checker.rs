//! Post-run invariant checks over the store contents

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tally_core::{ConsensusEngine, MatchEvent, RoomStatus, VoteError};

/// Findings for one room
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomReport {
    pub room_id: String,
    pub status: Option<RoomStatus>,
    pub result_item_id: Option<String>,
    pub positive_votes: usize,
    pub tallies: BTreeMap<String, u64>,
    pub match_events: usize,
    pub violations: Vec<String>,
}

impl RoomReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Verify the room against the events observed for it.
///
/// Reads go through `engine`, which should sit on a fault-free view of the store.
pub async fn check_room(
    engine: &ConsensusEngine,
    room_id: &str,
    events: &[MatchEvent],
) -> Result<RoomReport, VoteError> {
    let mut report = RoomReport {
        room_id: room_id.to_string(),
        ..Default::default()
    };

    let room = engine.rooms().get_room(room_id).await?;
    let votes = engine.ledger().votes_in(room_id).await?;
    let tallies = engine.aggregates().tallies(room_id).await?;

    // One record per (user, item)
    let mut seen = HashSet::new();
    for vote in &votes {
        if !seen.insert((vote.user_id.as_str(), vote.item_id.as_str())) {
            report
                .violations
                .push(format!("duplicate vote by {} on {}", vote.user_id, vote.item_id));
        }
    }

    // Tallies match positive records
    let mut recorded: BTreeMap<String, u64> = BTreeMap::new();
    for vote in votes.iter().filter(|v| v.kind.is_positive()) {
        *recorded.entry(vote.item_id.clone()).or_insert(0) += 1;
    }
    report.positive_votes = recorded.values().sum::<u64>() as usize;
    for tally in &tallies {
        report.tallies.insert(tally.item_id.clone(), tally.count);
        let expected = recorded.get(&tally.item_id).copied().unwrap_or(0);
        if tally.count != expected {
            report.violations.push(format!(
                "{} tallied {} but has {} positive votes",
                tally.item_id, tally.count, expected
            ));
        }
    }
    for (item, count) in &recorded {
        if !report.tallies.contains_key(item) {
            report
                .violations
                .push(format!("{} has {} positive votes but no tally", item, count));
        }
    }

    // Match decided once, announced once, on an item that reached quorum
    report.match_events = events.len();
    if events.len() > 1 {
        report
            .violations
            .push(format!("{} match events published", events.len()));
    }

    let Some(room) = room else {
        report.violations.push("room record missing".into());
        return Ok(report);
    };
    report.status = Some(room.status);
    report.result_item_id = room.result_item_id.clone();

    match (&room.result_item_id, room.status) {
        (Some(item), RoomStatus::Matched) => {
            let count = report.tallies.get(item).copied().unwrap_or(0);
            if count < u64::from(room.quorum) {
                report.violations.push(format!(
                    "matched on {} with {} of {} votes",
                    item, count, room.quorum
                ));
            }
            if events.iter().any(|e| &e.item_id != item) {
                report.violations.push("match event names a different item".into());
            }
        }
        (None, RoomStatus::Matched) => report.violations.push("MATCHED without result item".into()),
        (Some(_), status) => report
            .violations
            .push(format!("result item set while {}", status)),
        (None, _) => {
            if !events.is_empty() {
                report.violations.push("match event for an undecided room".into());
            }
        }
    }

    Ok(report)
}
