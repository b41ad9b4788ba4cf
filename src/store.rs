// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage boundary for a region's records and change log.
//!
//! The sync subsystem needs three things from the local store:
//! - a transactional "write record + append change log entry"
//! - indexed lookup of a record by `record_id`
//! - indexed lookup of change log entries by `synced_to` non-membership
//!   and by `sequence` range
//!
//! [`RegionStore`] captures exactly that. [`MemoryStore`] is the in-process
//! implementation; [`SqliteStore`](crate::change_log::SqliteStore) is the
//! durable one.
//!
//! # Atomic append
//!
//! `append` resolves the mutation against the stored version *inside* the
//! store's write critical section, so a concurrent local write and an
//! inbound entry for the same record cannot both believe they won.
//!
//! ```text
//! lock ─▶ read current ─▶ resolve ─┬─▶ KeepLocal    ─▶ Superseded { current }
//!                                  └─▶ TakeIncoming ─▶ write record
//!                                                      append entry
//!                                                      index pending peers ─▶ Applied { sequence }
//! ```

use crate::error::StoreError;
use crate::record::{sort_newest_first, ChangeEntry, Mutation, Record, RecordQuery};
use crate::resolver::{resolve, Resolution};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::Mutex;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// What `append` did with a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// Record written and entry logged at `sequence`.
    Applied { sequence: u64 },
    /// The stored version wins; nothing was written.
    Superseded { current: Record },
}

impl AppendOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, AppendOutcome::Applied { .. })
    }
}

/// What the sync subsystem needs from a region's local store.
pub trait RegionStore: Send + Sync + 'static {
    /// Fetch the stored version of a record (tombstones included).
    fn get(&self, record_id: &str) -> BoxFuture<'_, Option<Record>>;

    /// Resolve and, if the mutation wins, write the record and append its
    /// change log entry in one critical section.
    ///
    /// An error means neither the record nor the entry was written.
    fn append(&self, mutation: Mutation) -> BoxFuture<'_, AppendOutcome>;

    /// Entries not yet acknowledged by `peer`, ascending by sequence.
    fn unsent_for(&self, peer: &str, limit: usize) -> BoxFuture<'_, Vec<ChangeEntry>>;

    /// Record that `peer` holds these entries. Idempotent.
    ///
    /// Returns how many (entry, peer) pairs were newly recorded.
    fn mark_synced(&self, sequences: &[u64], peer: &str) -> BoxFuture<'_, usize>;

    /// Entries with `from <= sequence <= to`.
    fn entries_in_range(&self, from: u64, to: u64) -> BoxFuture<'_, Vec<ChangeEntry>>;

    /// Entries with `since <= timestamp` (and `timestamp <= until`), oldest first.
    fn entries_between(
        &self,
        since: i64,
        until: Option<i64>,
        limit: usize,
    ) -> BoxFuture<'_, Vec<ChangeEntry>>;

    /// Records matching the query, newest first.
    fn query(&self, query: &RecordQuery) -> BoxFuture<'_, Vec<Record>>;

    /// Highest sequence appended so far (0 when empty).
    fn head_sequence(&self) -> BoxFuture<'_, u64>;

    /// Flush and release resources on engine shutdown.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, Record>,
    log: BTreeMap<u64, ChangeEntry>,
    /// peer -> sequences that peer has not acknowledged
    pending: HashMap<String, BTreeSet<u64>>,
    next_sequence: u64,
}

/// In-process store. Not durable; used standalone and in tests.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store that indexes pending entries for `peers`.
    pub fn new<I, P>(peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let pending = peers
            .into_iter()
            .map(|p| (p.into(), BTreeSet::new()))
            .collect();
        Self {
            inner: Mutex::new(MemoryInner {
                pending,
                next_sequence: 1,
                ..Default::default()
            }),
        }
    }
}

impl RegionStore for MemoryStore {
    fn get(&self, record_id: &str) -> BoxFuture<'_, Option<Record>> {
        let record_id = record_id.to_string();
        Box::pin(async move { Ok(self.inner.lock().await.records.get(&record_id).cloned()) })
    }

    fn append(&self, mutation: Mutation) -> BoxFuture<'_, AppendOutcome> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let current = inner.records.get(&mutation.record_id).cloned();

            if let Some(current) = current.as_ref() {
                if resolve(&current.version(), &mutation.version()) == Resolution::KeepLocal {
                    return Ok(AppendOutcome::Superseded {
                        current: current.clone(),
                    });
                }
            }

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;

            let record = mutation.to_record(current.as_ref());
            inner.records.insert(record.record_id.clone(), record);
            inner.log.insert(sequence, mutation.to_entry(sequence));
            for (peer, pending) in inner.pending.iter_mut() {
                if !mutation.synced_to.contains(peer) {
                    pending.insert(sequence);
                }
            }

            Ok(AppendOutcome::Applied { sequence })
        })
    }

    fn unsent_for(&self, peer: &str, limit: usize) -> BoxFuture<'_, Vec<ChangeEntry>> {
        let peer = peer.to_string();
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let entries = match inner.pending.get(&peer) {
                Some(pending) => pending
                    .iter()
                    .take(limit)
                    .filter_map(|seq| inner.log.get(seq).cloned())
                    .collect(),
                // Unconfigured peer: no index, scan
                None => inner
                    .log
                    .values()
                    .filter(|e| !e.synced_to.contains(&peer))
                    .take(limit)
                    .cloned()
                    .collect(),
            };
            Ok(entries)
        })
    }

    fn mark_synced(&self, sequences: &[u64], peer: &str) -> BoxFuture<'_, usize> {
        let sequences = sequences.to_vec();
        let peer = peer.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let mut marked = 0;
            for seq in &sequences {
                if let Some(entry) = inner.log.get_mut(seq) {
                    if entry.synced_to.insert(peer.clone()) {
                        marked += 1;
                    }
                }
            }
            if let Some(pending) = inner.pending.get_mut(&peer) {
                for seq in &sequences {
                    pending.remove(seq);
                }
            }
            Ok(marked)
        })
    }

    fn entries_in_range(&self, from: u64, to: u64) -> BoxFuture<'_, Vec<ChangeEntry>> {
        Box::pin(async move {
            if from > to {
                return Ok(Vec::new());
            }
            let inner = self.inner.lock().await;
            Ok(inner.log.range(from..=to).map(|(_, e)| e.clone()).collect())
        })
    }

    fn entries_between(
        &self,
        since: i64,
        until: Option<i64>,
        limit: usize,
    ) -> BoxFuture<'_, Vec<ChangeEntry>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut entries: Vec<ChangeEntry> = inner
                .log
                .values()
                .filter(|e| e.timestamp >= since && until.map_or(true, |u| e.timestamp <= u))
                .cloned()
                .collect();
            entries.sort_by_key(|e| (e.timestamp, e.sequence));
            entries.truncate(limit);
            Ok(entries)
        })
    }

    fn query(&self, query: &RecordQuery) -> BoxFuture<'_, Vec<Record>> {
        let query = query.clone();
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut records: Vec<Record> = inner
                .records
                .values()
                .filter(|r| query.matches(r))
                .cloned()
                .collect();
            sort_newest_first(&mut records);
            records.truncate(query.limit);
            Ok(records)
        })
    }

    fn head_sequence(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { Ok(self.inner.lock().await.next_sequence - 1) })
    }
}
