//! Query router: local-only or scatter-gather reads.
//!
//! ```text
//! query(scope) ──┬── LocalOnly ─────────────────────────────────▶ local store
//!                │
//!                └── AllRegions ──┬── isolated ─▶ degrade ─────▶ local store
//!                                 │
//!                                 └── connected ─▶ local store
//!                                                 + join_all(reachable peers, fan-out timeout)
//!                                                 ─▶ merge by record_id (LWW)
//! ```
//!
//! Availability beats completeness: an isolated region answers from local
//! data instead of blocking, and a peer that fails or times out mid fan-out
//! is left out of the merge rather than failing the read. The metadata says
//! which regions actually contributed.

use crate::error::Result;
use crate::metrics;
use crate::partition::IsolationState;
use crate::peer::PeerManager;
use crate::record::{sort_newest_first, Record, RecordQuery};
use crate::resolver::{resolve, Resolution};
use crate::store::RegionStore;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Caller-chosen read scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    LocalOnly,
    AllRegions,
}

/// How a query was actually served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    /// Scope the caller asked for.
    pub scope: QueryScope,
    /// All-regions read narrowed to local data because the region is isolated.
    pub degraded: bool,
    /// Every region asked, local first.
    pub regions_queried: Vec<String>,
    pub regions_succeeded: Vec<String>,
    pub regions_failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub records: Vec<Record>,
    pub metadata: QueryMetadata,
}

/// Routes reads to the local store and, when connected, to peers.
pub struct QueryRouter<S: RegionStore> {
    local_region: String,
    store: Arc<S>,
    peers: Arc<PeerManager>,
    isolation: watch::Receiver<IsolationState>,
}

impl<S: RegionStore> Clone for QueryRouter<S> {
    fn clone(&self) -> Self {
        Self {
            local_region: self.local_region.clone(),
            store: Arc::clone(&self.store),
            peers: Arc::clone(&self.peers),
            isolation: self.isolation.clone(),
        }
    }
}

impl<S: RegionStore> QueryRouter<S> {
    pub fn new(
        local_region: impl Into<String>,
        store: Arc<S>,
        peers: Arc<PeerManager>,
        isolation: watch::Receiver<IsolationState>,
    ) -> Self {
        Self {
            local_region: local_region.into(),
            store,
            peers,
            isolation,
        }
    }

    /// Serve a read. Only a local store failure is an error.
    pub async fn query(&self, scope: QueryScope, query: &RecordQuery) -> Result<QueryResult> {
        let isolated = self.isolation.borrow().active;

        if scope == QueryScope::LocalOnly || isolated {
            if scope == QueryScope::AllRegions {
                debug!("Region isolated, serving all-regions read from local store");
            }
            let records = self.store.query(query).await?;
            metrics::record_query(scope, scope == QueryScope::AllRegions);
            return Ok(QueryResult {
                records,
                metadata: QueryMetadata {
                    scope,
                    degraded: scope == QueryScope::AllRegions,
                    regions_queried: vec![self.local_region.clone()],
                    regions_succeeded: vec![self.local_region.clone()],
                    regions_failed: Vec::new(),
                },
            });
        }

        self.scatter_gather(query).await
    }

    async fn scatter_gather(&self, query: &RecordQuery) -> Result<QueryResult> {
        // Tombstones must take part in the merge or a stale live copy would win.
        // Fetch every match: tombstones and copies superseded elsewhere would
        // otherwise use up the limit before the merge drops them.
        let merge_query = RecordQuery {
            limit: usize::MAX,
            since: query.since,
            include_deleted: true,
        };

        let peers = self.peers.reachable();
        let local = self.store.query(&merge_query).await?;
        let remote = join_all(peers.iter().map(|peer| peer.fetch_records(&merge_query))).await;

        let mut metadata = QueryMetadata {
            scope: QueryScope::AllRegions,
            degraded: false,
            regions_queried: vec![self.local_region.clone()],
            regions_succeeded: vec![self.local_region.clone()],
            regions_failed: Vec::new(),
        };

        let mut sets = vec![local];
        for (peer, result) in peers.iter().zip(remote) {
            let region = peer.region_id().to_string();
            metadata.regions_queried.push(region.clone());
            match result {
                Ok(records) => {
                    metrics::record_fanout(&region, true);
                    metadata.regions_succeeded.push(region);
                    sets.push(records);
                }
                Err(e) => {
                    warn!(peer_id = %region, error = %e, "Excluding peer from fan-out read");
                    metrics::record_fanout(&region, false);
                    metadata.regions_failed.push(region);
                }
            }
        }

        let mut records = merge(sets, query.include_deleted);
        records.truncate(query.limit);
        metrics::record_query(QueryScope::AllRegions, false);

        Ok(QueryResult { records, metadata })
    }
}

/// Merge record sets from several regions.
///
/// Keeps one record per `record_id`, the one that wins resolution, then
/// drops tombstones unless asked for and sorts newest first.
pub fn merge<I>(sets: I, include_deleted: bool) -> Vec<Record>
where
    I: IntoIterator<Item = Vec<Record>>,
{
    let mut merged: HashMap<String, Record> = HashMap::new();
    for record in sets.into_iter().flatten() {
        match merged.get(&record.record_id) {
            Some(kept) if resolve(&kept.version(), &record.version()) == Resolution::KeepLocal => {}
            _ => {
                merged.insert(record.record_id.clone(), record);
            }
        }
    }

    let mut records: Vec<Record> = merged
        .into_values()
        .filter(|r| include_deleted || !r.deleted)
        .collect();
    sort_newest_first(&mut records);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::SqliteStore;
    use crate::config::{ChangeLogConfig, PeerConfig, SyncSettings};
    use crate::record::{Mutation, Operation};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn rec(id: &str, ts: i64, region: &str, deleted: bool) -> Record {
        Record {
            record_id: id.to_string(),
            region_origin: region.to_string(),
            modified_in: region.to_string(),
            last_modified: ts,
            payload: json!({ "from": region }),
            deleted,
        }
    }

    #[test]
    fn test_merge_keeps_latest_per_record() {
        let merged = merge(
            vec![
                vec![rec("a", 100, "us-east", false), rec("b", 50, "us-east", false)],
                vec![rec("a", 105, "eu-west", false)],
            ],
            false,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].record_id, "a");
        assert_eq!(merged[0].modified_in, "eu-west");
        assert_eq!(merged[1].record_id, "b");
    }

    #[test]
    fn test_merge_order_independent() {
        let x = vec![rec("a", 100, "eu-west", false)];
        let y = vec![rec("a", 100, "us-east", false)];
        let xy = merge(vec![x.clone(), y.clone()], false);
        let yx = merge(vec![y, x], false);
        assert_eq!(xy, yx);
        assert_eq!(xy[0].modified_in, "us-east");
    }

    #[test]
    fn test_merge_tombstone_hides_older_live_copy() {
        let merged = merge(
            vec![vec![rec("a", 100, "us-east", false)], vec![rec("a", 200, "eu-west", true)]],
            false,
        );
        assert!(merged.is_empty());

        let with_deleted = merge(
            vec![vec![rec("a", 100, "us-east", false)], vec![rec("a", 200, "eu-west", true)]],
            true,
        );
        assert_eq!(with_deleted.len(), 1);
        assert!(with_deleted[0].deleted);
    }

    #[test]
    fn test_merge_ties_sorted_by_record_id() {
        let merged = merge(
            vec![vec![rec("b", 10, "x", false), rec("a", 10, "x", false)]],
            false,
        );
        assert_eq!(
            merged.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(["eu-west"]));
        store
            .append(Mutation {
                operation: Operation::Insert,
                record_id: "local-1".into(),
                payload: json!({}),
                timestamp: 10,
                region_origin: "us-east".into(),
                record_origin: "us-east".into(),
                synced_to: BTreeSet::from(["us-east".to_string()]),
            })
            .await
            .unwrap();
        store
    }

    fn router(
        store: Arc<MemoryStore>,
        state: IsolationState,
    ) -> (QueryRouter<MemoryStore>, watch::Sender<IsolationState>) {
        let peers = PeerManager::new(&SyncSettings::default()).unwrap();
        peers.add_peer(PeerConfig::for_testing("eu-west", "http://127.0.0.1:1"));
        let (tx, rx) = watch::channel(state);
        (QueryRouter::new("us-east", store, Arc::new(peers), rx), tx)
    }

    #[tokio::test]
    async fn test_local_only_ignores_peers() {
        let (router, _tx) = router(seeded_store().await, IsolationState::initial(1));
        let result = router.query(QueryScope::LocalOnly, &RecordQuery::default()).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert!(!result.metadata.degraded);
        assert_eq!(result.metadata.regions_queried, vec!["us-east"]);
    }

    #[tokio::test]
    async fn test_all_regions_degrades_when_isolated() {
        let isolated = IsolationState {
            active: true,
            isolation_start: Some(1),
            connected_count: 0,
            total_peers: 1,
        };
        let (router, _tx) = router(seeded_store().await, isolated);
        let result = router.query(QueryScope::AllRegions, &RecordQuery::default()).await.unwrap();
        assert!(result.metadata.degraded);
        assert_eq!(result.metadata.regions_queried, vec!["us-east"]);
        assert_eq!(result.records.len(), 1);
    }

    async fn append(store: &impl RegionStore, id: &str, ts: i64, operation: Operation) {
        store
            .append(Mutation {
                operation,
                record_id: id.into(),
                payload: json!({ "id": id }),
                timestamp: ts,
                region_origin: "us-east".into(),
                record_origin: "us-east".into(),
                synced_to: BTreeSet::from(["us-east".to_string()]),
            })
            .await
            .unwrap();
    }

    /// Newer tombstones must not use up the limit of an all-regions read.
    async fn assert_limit_counts_live_records<S: RegionStore>(store: Arc<S>) {
        append(store.as_ref(), "live", 10, Operation::Insert).await;
        append(store.as_ref(), "gone", 15, Operation::Insert).await;
        append(store.as_ref(), "gone", 20, Operation::Delete).await;
        append(store.as_ref(), "also-gone", 25, Operation::Delete).await;

        let peers = PeerManager::new(&SyncSettings::default()).unwrap();
        let (_tx, rx) = watch::channel(IsolationState::initial(0));
        let router = QueryRouter::new("us-east", store, Arc::new(peers), rx);
        let query = RecordQuery {
            limit: 1,
            ..RecordQuery::default()
        };

        let local = router.query(QueryScope::LocalOnly, &query).await.unwrap();
        let all = router.query(QueryScope::AllRegions, &query).await.unwrap();
        let ids = |r: &QueryResult| r.records.iter().map(|r| r.record_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&local), vec!["live"]);
        assert_eq!(ids(&all), vec!["live"]);
        assert!(!all.metadata.degraded);

        let with_deleted = RecordQuery {
            limit: 2,
            include_deleted: true,
            ..RecordQuery::default()
        };
        let all = router.query(QueryScope::AllRegions, &with_deleted).await.unwrap();
        assert_eq!(ids(&all), vec!["also-gone", "gone"]);
    }

    #[tokio::test]
    async fn test_all_regions_limit_skips_tombstones_memory() {
        assert_limit_counts_live_records(Arc::new(MemoryStore::new(Vec::<String>::new()))).await;
    }

    #[tokio::test]
    async fn test_all_regions_limit_skips_tombstones_sqlite() {
        let store = SqliteStore::open(&ChangeLogConfig::in_memory(), &[]).await.unwrap();
        assert_limit_counts_live_records(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_failed_peer_excluded_from_merge() {
        let (router, _tx) = router(seeded_store().await, IsolationState::initial(1));
        let result = router.query(QueryScope::AllRegions, &RecordQuery::default()).await.unwrap();
        assert!(!result.metadata.degraded);
        assert_eq!(result.metadata.regions_queried, vec!["us-east", "eu-west"]);
        assert_eq!(result.metadata.regions_succeeded, vec!["us-east"]);
        assert_eq!(result.metadata.regions_failed, vec!["eu-west"]);
        assert_eq!(result.records.len(), 1);
    }
}
