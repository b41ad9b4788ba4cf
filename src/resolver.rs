//! Last-write-wins conflict resolution.
//!
//! Versions are compared whole-document: a concurrent edit to a different
//! field than the conflicting write is still fully overwritten.
//!
//! Ordering is `(timestamp, region, deleted)`:
//! - the strictly greater `timestamp` wins
//! - on a tie, the region id that sorts greater (byte order) wins
//! - on a tie of both, the tombstone wins
//!
//! Every region applies the same total order, so every region converges on
//! the same winner whatever order entries arrive in.

use crate::record::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Mutex;

/// Outcome of comparing the stored version with an incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Stored version stands (includes an exact replay).
    KeepLocal,
    /// Incoming version replaces the stored one.
    TakeIncoming,
}

/// Total order over versions.
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.region.as_bytes().cmp(b.region.as_bytes()))
        .then_with(|| a.deleted.cmp(&b.deleted))
}

/// Decide whether `incoming` replaces `local`.
pub fn resolve(local: &Version, incoming: &Version) -> Resolution {
    match compare(incoming, local) {
        Ordering::Greater => Resolution::TakeIncoming,
        Ordering::Equal | Ordering::Less => Resolution::KeepLocal,
    }
}

/// The winning version of the two, independent of argument order.
pub fn winner<'a>(a: &'a Version, b: &'a Version) -> &'a Version {
    match compare(a, b) {
        Ordering::Less => b,
        _ => a,
    }
}

// =============================================================================
// Conflict accounting (status reporting only)
// =============================================================================

/// How many recent conflicts the status report keeps.
pub const RECENT_CONFLICTS: usize = 100;

/// Which side of a conflict won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    RemoteWins,
    LocalWins,
}

/// One observed conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub record_id: String,
    pub outcome: ConflictOutcome,
    pub local: Version,
    pub incoming: Version,
    pub observed_at: i64,
}

/// Snapshot of conflict counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub total_conflicts: u64,
    pub remote_wins: u64,
    pub local_wins: u64,
    pub recent_conflicts: Vec<ConflictRecord>,
}

/// Running conflict counters plus a bounded history.
///
/// A conflict is an incoming version that differs from a stored version
/// written by a different region. Replays and same-region successors are
/// not counted.
#[derive(Debug, Default)]
pub struct ConflictStats {
    total: AtomicU64,
    remote_wins: AtomicU64,
    local_wins: AtomicU64,
    recent: Mutex<VecDeque<ConflictRecord>>,
}

impl ConflictStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether comparing these two versions counts as a conflict.
    pub fn is_conflict(local: &Version, incoming: &Version) -> bool {
        local != incoming && local.region != incoming.region
    }

    pub async fn record(&self, record_id: &str, local: &Version, incoming: &Version, observed_at: i64) {
        if !Self::is_conflict(local, incoming) {
            return;
        }

        let outcome = match resolve(local, incoming) {
            Resolution::TakeIncoming => {
                self.remote_wins.fetch_add(1, AtomicOrdering::Relaxed);
                ConflictOutcome::RemoteWins
            }
            Resolution::KeepLocal => {
                self.local_wins.fetch_add(1, AtomicOrdering::Relaxed);
                ConflictOutcome::LocalWins
            }
        };
        self.total.fetch_add(1, AtomicOrdering::Relaxed);
        crate::metrics::record_conflict(outcome);

        let mut recent = self.recent.lock().await;
        if recent.len() == RECENT_CONFLICTS {
            recent.pop_front();
        }
        recent.push_back(ConflictRecord {
            record_id: record_id.to_string(),
            outcome,
            local: local.clone(),
            incoming: incoming.clone(),
            observed_at,
        });
    }

    pub async fn summary(&self) -> ConflictSummary {
        ConflictSummary {
            total_conflicts: self.total.load(AtomicOrdering::Relaxed),
            remote_wins: self.remote_wins.load(AtomicOrdering::Relaxed),
            local_wins: self.local_wins.load(AtomicOrdering::Relaxed),
            recent_conflicts: self.recent.lock().await.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(ts: i64, region: &str) -> Version {
        Version::new(ts, region, false)
    }

    #[test]
    fn test_later_timestamp_wins() {
        assert_eq!(resolve(&v(100, "a"), &v(105, "b")), Resolution::TakeIncoming);
        assert_eq!(resolve(&v(105, "b"), &v(100, "a")), Resolution::KeepLocal);
    }

    #[test]
    fn test_tie_breaks_on_region() {
        assert_eq!(resolve(&v(100, "eu-west"), &v(100, "us-east")), Resolution::TakeIncoming);
        assert_eq!(resolve(&v(100, "us-east"), &v(100, "eu-west")), Resolution::KeepLocal);
    }

    #[test]
    fn test_replay_keeps_local() {
        let version = v(100, "a");
        assert_eq!(resolve(&version, &version.clone()), Resolution::KeepLocal);
    }

    #[test]
    fn test_tombstone_participates() {
        let tombstone = Version::new(200, "a", true);
        assert_eq!(resolve(&v(150, "b"), &tombstone), Resolution::TakeIncoming);
        assert_eq!(resolve(&tombstone, &v(250, "b")), Resolution::TakeIncoming);
        assert_eq!(resolve(&tombstone, &v(150, "b")), Resolution::KeepLocal);
    }

    #[test]
    fn test_tombstone_wins_full_tie() {
        let live = v(10, "a");
        let dead = Version::new(10, "a", true);
        assert_eq!(winner(&live, &dead), &dead);
        assert_eq!(winner(&dead, &live), &dead);
    }

    #[test]
    fn test_winner_commutative() {
        let a = v(7, "x");
        let b = v(7, "y");
        assert_eq!(winner(&a, &b), winner(&b, &a));
    }

    #[tokio::test]
    async fn test_conflict_stats_counts_cross_region_only() {
        let stats = ConflictStats::new();

        // Same version twice is a replay
        stats.record("r", &v(1, "a"), &v(1, "a"), 0).await;
        // Same region successor is an ordinary update
        stats.record("r", &v(1, "a"), &v(2, "a"), 0).await;
        assert_eq!(stats.summary().await.total_conflicts, 0);

        stats.record("r", &v(100, "a"), &v(105, "b"), 0).await;
        stats.record("r", &v(105, "b"), &v(100, "a"), 0).await;

        let summary = stats.summary().await;
        assert_eq!(summary.total_conflicts, 2);
        assert_eq!(summary.remote_wins, 1);
        assert_eq!(summary.local_wins, 1);
        assert_eq!(summary.recent_conflicts[0].outcome, ConflictOutcome::RemoteWins);
    }

    #[tokio::test]
    async fn test_recent_conflicts_bounded() {
        let stats = ConflictStats::new();
        for i in 0..(RECENT_CONFLICTS as i64 + 10) {
            stats.record(&format!("r{}", i), &v(i, "a"), &v(i + 1, "b"), i).await;
        }
        let summary = stats.summary().await;
        assert_eq!(summary.recent_conflicts.len(), RECENT_CONFLICTS);
        assert_eq!(summary.recent_conflicts[0].record_id, "r10");
    }
}
