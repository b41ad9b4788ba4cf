//! Inbound handler: applies a batch pushed by a peer.
//!
//! Each entry is decoded on its own and applied through
//! [`RegionStore::append`], which resolves it against the stored version
//! atomically. Entries that lose resolution, and entries replayed after a
//! lost acknowledgement, are acknowledged without changing anything.
//!
//! ```text
//! SyncBatch ──▶ decode_entry ──┬── malformed ──▶ warn + rejected
//!                              │
//!                              └──▶ get current ──▶ append ──┬── Applied    ──▶ applied
//!                                                           └── Superseded ──▶ superseded
//! ```
//!
//! An applied entry is appended to the local change log with
//! `synced_to = {relaying peer, local region, originating region}`, so the
//! outbound loops relay it onward to every other peer and never echo it
//! back to where it came from. `region_origin` and `timestamp` are
//! preserved, which is what lets relayed copies resolve identically in
//! every region.
//!
//! A store failure aborts the batch with an error and no acknowledgement.
//! The peer re-sends, and entries already applied resolve as replays.

use crate::error::Result;
use crate::metrics;
use crate::record::{now_millis, ChangeEntry, Mutation};
use crate::resolver::ConflictStats;
use crate::store::{AppendOutcome, RegionStore};
use crate::wire::{decode_entry, SyncAck, SyncBatch};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Applies peer batches to the local store.
pub struct InboundHandler<S: RegionStore> {
    store: Arc<S>,
    local_region: String,
    conflicts: Arc<ConflictStats>,
}

impl<S: RegionStore> InboundHandler<S> {
    pub fn new(store: Arc<S>, local_region: impl Into<String>, conflicts: Arc<ConflictStats>) -> Self {
        Self {
            store,
            local_region: local_region.into(),
            conflicts,
        }
    }

    /// Apply every well-formed entry in `batch`.
    #[instrument(skip(self, batch), fields(source = %batch.source_region, entries = batch.operations.len()))]
    pub async fn apply(&self, batch: SyncBatch) -> Result<SyncAck> {
        let start = Instant::now();
        let mut ack = SyncAck {
            received: batch.operations.len(),
            ..Default::default()
        };

        for raw in &batch.operations {
            let entry = match decode_entry(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(source = %batch.source_region, error = %e, "Rejecting malformed entry");
                    ack.rejected += 1;
                    continue;
                }
            };

            if self.apply_entry(&batch.source_region, entry).await? {
                ack.applied += 1;
            } else {
                ack.superseded += 1;
            }
        }

        debug!(
            applied = ack.applied,
            superseded = ack.superseded,
            rejected = ack.rejected,
            "Applied inbound batch"
        );
        metrics::record_inbound_batch(&batch.source_region, &ack, start.elapsed());
        Ok(ack)
    }

    /// Apply one decoded entry. Returns `true` if it won and was written.
    async fn apply_entry(&self, relay: &str, entry: ChangeEntry) -> Result<bool> {
        let incoming = entry.version();
        let before = self.store.get(&entry.record_id).await?;

        let mutation = Mutation {
            synced_to: self.synced_to(relay, &entry.region_origin),
            operation: entry.operation,
            record_id: entry.record_id,
            payload: entry.payload,
            timestamp: entry.timestamp,
            region_origin: entry.region_origin,
            record_origin: entry.record_origin,
        };
        let outcome = self.store.append(mutation.clone()).await?;

        // Compare against what the store actually resolved against
        let local = match (&outcome, before) {
            (AppendOutcome::Superseded { current }, _) => Some(current.version()),
            (AppendOutcome::Applied { .. }, before) => before.map(|r| r.version()),
        };
        if let Some(local) = local {
            self.conflicts
                .record(&mutation.record_id, &local, &incoming, now_millis())
                .await;
        }

        match outcome {
            AppendOutcome::Applied { sequence } => {
                debug!(
                    record_id = %mutation.record_id,
                    sequence,
                    origin = %mutation.region_origin,
                    "Applied remote mutation"
                );
                Ok(true)
            }
            AppendOutcome::Superseded { .. } => Ok(false),
        }
    }

    fn synced_to(&self, relay: &str, origin: &str) -> BTreeSet<String> {
        [relay, self.local_region.as_str(), origin]
            .into_iter()
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Operation;
    use crate::resolver::ConflictOutcome;
    use crate::store::MemoryStore;
    use crate::wire::encode_entry;
    use serde_json::{json, Value};

    fn entry(seq: u64, id: &str, ts: i64, origin: &str, op: Operation) -> ChangeEntry {
        ChangeEntry {
            sequence: seq,
            operation: op,
            record_id: id.to_string(),
            payload: json!({ "ts": ts, "origin": origin }),
            timestamp: ts,
            region_origin: origin.to_string(),
            record_origin: origin.to_string(),
            synced_to: BTreeSet::new(),
        }
    }

    fn batch(source: &str, entries: &[ChangeEntry]) -> SyncBatch {
        SyncBatch::from_entries(source, entries).unwrap()
    }

    fn handler(peers: &[&str]) -> (InboundHandler<MemoryStore>, Arc<MemoryStore>, Arc<ConflictStats>) {
        let store = Arc::new(MemoryStore::new(peers.iter().copied()));
        let conflicts = Arc::new(ConflictStats::new());
        (
            InboundHandler::new(Arc::clone(&store), "us-east", Arc::clone(&conflicts)),
            store,
            conflicts,
        )
    }

    #[tokio::test]
    async fn test_apply_new_record() {
        let (handler, store, _) = handler(&["eu-west", "ap-south"]);
        let ack = handler
            .apply(batch("eu-west", &[entry(1, "r1", 100, "eu-west", Operation::Insert)]))
            .await
            .unwrap();

        assert_eq!(ack, SyncAck { received: 1, applied: 1, superseded: 0, rejected: 0 });
        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(record.region_origin, "eu-west");
        assert_eq!(record.modified_in, "eu-west");
        assert_eq!(record.last_modified, 100);
    }

    #[tokio::test]
    async fn test_applied_entry_relays_only_to_other_peers() {
        let (handler, store, _) = handler(&["eu-west", "ap-south"]);
        handler
            .apply(batch("eu-west", &[entry(1, "r1", 100, "eu-west", Operation::Insert)]))
            .await
            .unwrap();

        assert!(store.unsent_for("eu-west", 10).await.unwrap().is_empty());
        let relay = store.unsent_for("ap-south", 10).await.unwrap();
        assert_eq!(relay.len(), 1);
        assert_eq!(relay[0].region_origin, "eu-west");
        assert_eq!(relay[0].timestamp, 100);
        assert!(relay[0].synced_to.contains("us-east"));
    }

    #[tokio::test]
    async fn test_relayed_entry_not_echoed_to_origin() {
        let (handler, store, _) = handler(&["eu-west", "ap-south"]);
        // ap-south relays an entry that originated in eu-west
        handler
            .apply(batch("ap-south", &[entry(7, "r1", 100, "eu-west", Operation::Insert)]))
            .await
            .unwrap();
        assert!(store.unsent_for("eu-west", 10).await.unwrap().is_empty());
        assert!(store.unsent_for("ap-south", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_older_entry_superseded_and_counted() {
        let (handler, store, conflicts) = handler(&["eu-west"]);
        handler
            .apply(batch("eu-west", &[entry(1, "r1", 105, "eu-west", Operation::Update)]))
            .await
            .unwrap();

        let ack = handler
            .apply(batch("ap-south", &[entry(1, "r1", 100, "ap-south", Operation::Update)]))
            .await
            .unwrap();
        assert_eq!(ack.superseded, 1);
        assert_eq!(store.get("r1").await.unwrap().unwrap().last_modified, 105);

        let summary = conflicts.summary().await;
        assert_eq!(summary.total_conflicts, 1);
        assert_eq!(summary.local_wins, 1);
        assert_eq!(summary.recent_conflicts[0].outcome, ConflictOutcome::LocalWins);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (handler, store, conflicts) = handler(&["eu-west"]);
        let b = batch("eu-west", &[entry(1, "r1", 100, "eu-west", Operation::Insert)]);
        handler.apply(b.clone()).await.unwrap();
        let head = store.head_sequence().await.unwrap();

        let ack = handler.apply(b).await.unwrap();
        assert_eq!(ack.applied, 0);
        assert_eq!(ack.superseded, 1);
        assert_eq!(store.head_sequence().await.unwrap(), head);
        assert_eq!(conflicts.summary().await.total_conflicts, 0);
    }

    #[tokio::test]
    async fn test_malformed_entries_skipped() {
        let (handler, store, _) = handler(&["eu-west"]);
        let good = encode_entry(&entry(2, "r2", 50, "eu-west", Operation::Insert)).unwrap();
        let b = SyncBatch {
            source_region: "eu-west".into(),
            operations: vec![json!({"operation": "explode"}), Value::Null, good],
        };

        let ack = handler.apply(b).await.unwrap();
        assert_eq!(ack, SyncAck { received: 3, applied: 1, superseded: 0, rejected: 2 });
        assert!(store.get("r2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_that_blocks_older_update() {
        let (handler, store, _) = handler(&["eu-west"]);
        handler
            .apply(batch(
                "eu-west",
                &[
                    entry(1, "r1", 100, "eu-west", Operation::Insert),
                    entry(2, "r1", 200, "eu-west", Operation::Delete),
                ],
            ))
            .await
            .unwrap();

        let ack = handler
            .apply(batch("ap-south", &[entry(9, "r1", 150, "ap-south", Operation::Update)]))
            .await
            .unwrap();
        assert_eq!(ack.superseded, 1);
        assert!(store.get("r1").await.unwrap().unwrap().deleted);
    }
}
