// Concurrent-edit arbitration.
//
// Changes to the same logical item (keyed by message type plus item id or
// viewer mode) that arrive within the detection window are a conflict.
// Exactly one of three deterministic strategies picks the winner, selected
// by the session's settings. A resolution is produced once and the
// recorded history for the item is collapsed to the winning value, so the
// same conflict is never re-resolved.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use slicesync_common::types::ConflictStrategy;

pub const DEFAULT_CONFLICT_WINDOW_MS: i64 = 500;

/// One competitor in a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct CompetingChange {
    pub user_id: String,
    /// Sender-side timestamp from the message envelope.
    pub timestamp: DateTime<Utc>,
    /// Local arrival order, used to break timestamp ties.
    pub arrival: u64,
    pub data: Value,
}

/// The record of one detected conflict. `resolution` is `None` only for
/// `host-wins` conflicts in which the host made no competing change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub conflict_id: Uuid,
    pub item_key: String,
    pub participants: Vec<String>,
    pub changes: Vec<CompetingChange>,
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ConflictStrategy,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    pub final_value: Value,
}

/// What the caller should do with an incoming change.
#[derive(Debug, Clone, PartialEq)]
pub enum Arbitration {
    /// No overlapping change: apply the incoming value as-is.
    Apply(Value),
    /// Conflict resolved: apply `resolution.final_value`.
    Resolved(ConflictResolution),
    /// `host-wins` with no host change yet: hold the local value and keep
    /// the competitors recorded until the host weighs in or the window
    /// passes.
    Pending(ConflictResolution),
}

#[derive(Debug)]
struct RecordedChange {
    recorded_at: DateTime<Utc>,
    change: CompetingChange,
}

/// Per-item sliding-window change history plus the arbitration logic.
#[derive(Debug)]
pub struct ConflictResolver {
    window: Duration,
    recent: HashMap<String, Vec<RecordedChange>>,
    arrival_seq: u64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(std::time::Duration::from_millis(DEFAULT_CONFLICT_WINDOW_MS as u64))
    }
}

impl ConflictResolver {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window)
                .unwrap_or_else(|_| Duration::milliseconds(DEFAULT_CONFLICT_WINDOW_MS)),
            recent: HashMap::new(),
            arrival_seq: 0,
        }
    }

    /// Record a locally authored change so that a remote change arriving
    /// within the window is detected as concurrent. Local changes apply
    /// immediately and are never arbitrated against themselves.
    pub fn record_local(
        &mut self,
        item_key: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
        data: Value,
        now: DateTime<Utc>,
    ) {
        self.prune(item_key, now);
        let change = self.make_change(user_id, timestamp, data);
        self.recent.entry(item_key.to_string()).or_default().push(RecordedChange {
            recorded_at: now,
            change,
        });
    }

    /// Arbitrate an incoming remote change against the recorded window.
    pub fn arbitrate(
        &mut self,
        item_key: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
        data: Value,
        strategy: ConflictStrategy,
        host_id: &str,
        now: DateTime<Utc>,
    ) -> Arbitration {
        self.prune(item_key, now);
        let incoming = self.make_change(user_id, timestamp, data);

        let history = self.recent.entry(item_key.to_string()).or_default();
        let concurrent = history.iter().any(|r| r.change.user_id != incoming.user_id);
        if !concurrent {
            // Same author or empty window: plain remote apply.
            let value = incoming.data.clone();
            history.push(RecordedChange { recorded_at: now, change: incoming });
            return Arbitration::Apply(value);
        }

        let mut changes: Vec<CompetingChange> =
            history.iter().map(|r| r.change.clone()).collect();
        let incoming_record = incoming.clone();
        changes.push(incoming);
        changes.sort_by(|a, b| (a.timestamp, a.arrival).cmp(&(b.timestamp, b.arrival)));

        let mut participants: Vec<String> =
            changes.iter().map(|c| c.user_id.clone()).collect();
        participants.dedup();
        participants.sort();
        participants.dedup();

        let conflict_id = Uuid::new_v4();
        debug!(%conflict_id, item_key, ?strategy, competitors = changes.len(), "conflict detected");

        let resolution = match strategy {
            ConflictStrategy::HostWins => Self::resolve_host_wins(&changes, host_id, now),
            ConflictStrategy::Timestamp => Self::resolve_timestamp(&changes, now),
            ConflictStrategy::Merge => Self::resolve_merge(&changes, now),
        };

        let record = ConflictResolution {
            conflict_id,
            item_key: item_key.to_string(),
            participants,
            changes,
            resolution,
        };

        match &record.resolution {
            Some(resolution) => {
                // Collapse the history to the winner: resolved exactly
                // once, never re-resolved.
                let winner = self.make_change(
                    resolution.resolved_by.clone(),
                    resolution.resolved_at,
                    resolution.final_value.clone(),
                );
                self.recent.insert(
                    item_key.to_string(),
                    vec![RecordedChange { recorded_at: now, change: winner }],
                );
                Arbitration::Resolved(record)
            }
            None => {
                // Keep the competitors recorded so the host's eventual
                // change resolves against all of them.
                self.recent
                    .entry(item_key.to_string())
                    .or_default()
                    .push(RecordedChange { recorded_at: now, change: incoming_record });
                Arbitration::Pending(record)
            }
        }
    }

    /// Drop all recorded history (session end).
    pub fn clear(&mut self) {
        self.recent.clear();
    }

    fn make_change(
        &mut self,
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: Value,
    ) -> CompetingChange {
        let arrival = self.arrival_seq;
        self.arrival_seq += 1;
        CompetingChange { user_id: user_id.into(), timestamp, arrival, data }
    }

    fn prune(&mut self, item_key: &str, now: DateTime<Utc>) {
        if let Some(history) = self.recent.get_mut(item_key) {
            history.retain(|r| now - r.recorded_at <= self.window);
            if history.is_empty() {
                self.recent.remove(item_key);
            }
        }
    }

    // host-wins: the host's latest competing change wins; no host change
    // leaves the conflict pending.
    fn resolve_host_wins(
        changes: &[CompetingChange],
        host_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        changes.iter().rev().find(|c| c.user_id == host_id).map(|winner| Resolution {
            strategy: ConflictStrategy::HostWins,
            resolved_by: winner.user_id.clone(),
            resolved_at: now,
            final_value: winner.data.clone(),
        })
    }

    // timestamp: latest sender timestamp wins; ties go to the later
    // arrival. `changes` is already sorted by (timestamp, arrival).
    fn resolve_timestamp(changes: &[CompetingChange], now: DateTime<Utc>) -> Option<Resolution> {
        changes.last().map(|winner| Resolution {
            strategy: ConflictStrategy::Timestamp,
            resolved_by: winner.user_id.clone(),
            resolved_at: now,
            final_value: winner.data.clone(),
        })
    }

    // merge: shallow field union in (timestamp, arrival) order, later
    // changes overwriting earlier ones per field. A non-object payload
    // replaces the accumulator wholesale.
    fn resolve_merge(changes: &[CompetingChange], now: DateTime<Utc>) -> Option<Resolution> {
        let mut merged = Value::Object(serde_json::Map::new());
        for change in changes {
            match (&mut merged, &change.data) {
                (Value::Object(acc), Value::Object(fields)) => {
                    for (key, value) in fields {
                        acc.insert(key.clone(), value.clone());
                    }
                }
                _ => merged = change.data.clone(),
            }
        }
        changes.last().map(|last| Resolution {
            strategy: ConflictStrategy::Merge,
            resolved_by: last.user_id.clone(),
            resolved_at: now,
            final_value: merged.clone(),
        })
    }
}
