// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Peer state and transport via [`crate::peer::PeerManager`]
//! - One outbound loop per peer (see [`outbound`])
//! - The inbound handler via [`crate::inbound::InboundHandler`]
//! - Island mode detection via [`crate::partition::PartitionDetector`]
//! - Reads via [`crate::router::QueryRouter`]
//!
//! # Architecture
//!
//! Background tasks never call each other. They communicate only through
//! the durable change log (the store) and the peer/isolation snapshots:
//!
//! ```text
//!  write_local ──┐                         ┌──▶ outbound(peer A) ──▶ POST /internal/sync
//!                ├──▶ RegionStore::append ─┤
//!  receive_batch ┘     (change log)        └──▶ outbound(peer B) ──▶ POST /internal/sync
//!
//!  PartitionDetector ──probe──▶ PeerConnection atomics
//!         │
//!         └──watch──▶ IsolationState ──▶ QueryRouter, status()
//! ```
//!
//! One peer's slowness or outage stalls only its own outbound loop.

mod types;
pub mod outbound;

pub use types::{EngineState, LocalWrite, WriteReceipt};

use crate::change_log::SqliteStore;
use crate::config::SyncConfig;
use crate::error::{ReplicationError, Result};
use crate::inbound::InboundHandler;
use crate::metrics;
use crate::partition::{IsolationState, PartitionDetector};
use crate::peer::{epoch_millis, PeerManager};
use crate::record::{now_millis, ChangeEntry, Mutation, Record, RecordQuery};
use crate::resolver::ConflictStats;
use crate::router::{QueryResult, QueryRouter, QueryScope};
use crate::store::{AppendOutcome, RegionStore};
use crate::wire::{millis_to_utc, HealthResponse, IslandModeStatus, StatusReport, SyncAck, SyncBatch};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Attempts for a clock-stamped local write that races an inbound entry.
const LOCAL_WRITE_ATTEMPTS: usize = 3;

/// How long shutdown waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The cross-region sync engine for one region.
///
/// Owns the region's view of its peers and drives replication to and from
/// them. The store is shared: applications write through
/// [`write_local`](Self::write_local) so every mutation lands in the change
/// log, and peers deliver through [`receive_batch`](Self::receive_batch).
pub struct SyncEngine<S: RegionStore> {
    config: SyncConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    store: Arc<S>,
    peer_manager: Arc<PeerManager>,
    detector: Arc<PartitionDetector>,
    inbound: InboundHandler<S>,
    conflicts: Arc<ConflictStats>,
    router: QueryRouter<S>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Background task handles
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine<SqliteStore> {
    /// Open the SQLite change log named in the config and build an engine on it.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::open(&config.change_log, &config.peer_ids()).await?;
        Self::new(config, Arc::new(store))
    }
}

impl<S: RegionStore> SyncEngine<S> {
    /// Create a sync engine over an existing store.
    ///
    /// The engine starts in `Created` state: inbound batches and local
    /// writes are accepted immediately, but nothing is pushed or probed
    /// until [`start()`](Self::start).
    pub fn new(config: SyncConfig, store: Arc<S>) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let peer_manager = Arc::new(PeerManager::new(&config.settings)?);
        for peer_config in &config.peers {
            peer_manager.add_peer(peer_config.clone());
        }

        let detector = Arc::new(PartitionDetector::new(
            Arc::clone(&peer_manager),
            config.settings.probe.clone(),
        ));
        let conflicts = Arc::new(ConflictStats::new());
        let inbound = InboundHandler::new(Arc::clone(&store), config.local_region.clone(), Arc::clone(&conflicts));
        let router = QueryRouter::new(
            config.local_region.clone(),
            Arc::clone(&store),
            Arc::clone(&peer_manager),
            detector.subscribe(),
        );

        Ok(Self {
            config,
            state_tx,
            state_rx,
            store,
            peer_manager,
            detector,
            inbound,
            conflicts,
            router,
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start replicating.
    ///
    /// 1. Checks the store is readable
    /// 2. Spawns one outbound loop per peer
    /// 3. Spawns the partition detector
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            region = %self.config.local_region,
            peer_count = self.config.peers.len(),
            "Starting sync engine"
        );
        self.set_state(EngineState::Starting);

        let head = match self.store.head_sequence().await {
            Ok(head) => head,
            Err(e) => {
                error!(error = %e, "Change log unreadable, cannot start");
                self.set_state(EngineState::Failed);
                return Err(e.into());
            }
        };
        debug!(head, "Change log head");

        self.spawn_outbound_tasks().await;
        self.spawn_detector_task().await;

        self.set_state(EngineState::Running);
        info!(
            region = %self.config.local_region,
            peers = self.peer_manager.len(),
            "Sync engine running"
        );
        Ok(())
    }

    async fn spawn_outbound_tasks(&self) {
        let mut handles = self.handles.write().await;

        for peer in self.peer_manager.all() {
            let peer_id = peer.region_id().to_string();
            let store = Arc::clone(&self.store);
            let local_region = self.config.local_region.clone();
            let config = self.config.settings.outbound.clone();
            let shutdown_rx = self.shutdown_rx.clone();

            let handle = tokio::spawn(async move {
                outbound::run_outbound(peer, store, local_region, config, shutdown_rx).await;
            });

            info!(peer_id = %peer_id, "Spawned outbound loop");
            handles.push(handle);
        }
    }

    async fn spawn_detector_task(&self) {
        let detector = Arc::clone(&self.detector);
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(detector.run(shutdown_rx));

        debug!("Spawned partition detector");
        self.handles.write().await.push(handle);
    }

    /// Shutdown the sync engine gracefully.
    ///
    /// 1. Signal all background tasks to stop
    /// 2. Wait for each to finish its in-flight push (bounded)
    /// 3. Close the store
    pub async fn shutdown(&self) {
        info!("Shutting down sync engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close store");
        }

        self.set_state(EngineState::Stopped);
        info!("Sync engine stopped");
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a mutation made in this region.
    ///
    /// The record write and its change log entry commit together or not at
    /// all; a store failure is returned to the caller. Peer connectivity
    /// never affects the outcome.
    ///
    /// Without an explicit timestamp the write is stamped with the wall
    /// clock, bumped past the stored version so a local edit always wins
    /// locally. An explicit timestamp that loses to the stored version is
    /// rejected with [`ReplicationError::StaleWrite`].
    pub async fn write_local(&self, write: LocalWrite) -> Result<WriteReceipt> {
        let local = self.config.local_region.as_str();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let current = self.store.get(&write.record_id).await?;
            let timestamp = match (write.timestamp, current.as_ref()) {
                (Some(ts), _) => ts,
                (None, Some(c)) => now_millis().max(c.last_modified + 1),
                (None, None) => now_millis(),
            };

            let mutation = Mutation {
                operation: write.operation,
                record_id: write.record_id.clone(),
                payload: write.payload.clone(),
                timestamp,
                region_origin: local.to_string(),
                record_origin: current
                    .as_ref()
                    .map(|c| c.region_origin.clone())
                    .unwrap_or_else(|| local.to_string()),
                synced_to: BTreeSet::from([local.to_string()]),
            };

            let outcome = self.store.append(mutation).await;
            metrics::record_local_write(write.operation.as_str(), outcome.is_ok());

            match outcome? {
                AppendOutcome::Applied { sequence } => {
                    debug!(record_id = %write.record_id, sequence, timestamp, "Local write applied");
                    return Ok(WriteReceipt { sequence, timestamp });
                }
                AppendOutcome::Superseded { current } => {
                    // An inbound entry landed between our read and our append
                    if write.timestamp.is_none() && attempts < LOCAL_WRITE_ATTEMPTS {
                        continue;
                    }
                    return Err(ReplicationError::StaleWrite {
                        record_id: write.record_id,
                        attempted: timestamp,
                        current: current.last_modified,
                    });
                }
            }
        }
    }

    /// Apply a batch delivered by a peer.
    pub async fn receive_batch(&self, batch: SyncBatch) -> Result<SyncAck> {
        self.inbound.apply(batch).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Route a read through the query router.
    pub async fn query(&self, scope: QueryScope, query: &RecordQuery) -> Result<QueryResult> {
        self.router.query(scope, query).await
    }

    /// Local records only (served to peers for their fan-out reads).
    pub async fn local_records(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        Ok(self.store.query(query).await?)
    }

    /// Change log entries by timestamp range, for diagnostics.
    pub async fn changes_between(&self, since: i64, until: Option<i64>, limit: usize) -> Result<Vec<ChangeEntry>> {
        Ok(self.store.entries_between(since, until, limit).await?)
    }

    /// Current isolation snapshot.
    pub fn isolation(&self) -> IsolationState {
        self.detector.current()
    }

    /// Subscribe to isolation changes.
    pub fn isolation_receiver(&self) -> watch::Receiver<IsolationState> {
        self.detector.subscribe()
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".to_string(),
            region: self.config.local_region.clone(),
        }
    }

    /// Full status report. Performs no network I/O.
    pub async fn status(&self) -> Result<StatusReport> {
        let isolation = self.isolation();
        let isolation_duration_seconds = isolation
            .isolation_start
            .map(|start| (epoch_millis() as i64).saturating_sub(start).max(0) as u64 / 1000);

        Ok(StatusReport {
            region: self.config.local_region.clone(),
            engine_state: self.state().to_string(),
            island_mode: IslandModeStatus {
                active: isolation.active,
                isolation_start: isolation.isolation_start.and_then(millis_to_utc),
                isolation_duration_seconds,
                threshold_seconds: self.config.settings.probe.isolation_grace_duration().as_secs(),
                connected_count: isolation.connected_count,
                total_peers: isolation.total_peers,
            },
            peers: self.peer_manager.all().iter().map(|p| p.status()).collect(),
            conflicts: self.conflicts.summary().await,
            change_log_head: self.store.head_sequence().await?,
        })
    }

    pub fn router(&self) -> &QueryRouter<S> {
        &self.router
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the peer manager (for metrics/diagnostics).
    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub fn detector(&self) -> &Arc<PartitionDetector> {
        &self.detector
    }

    pub fn local_region(&self) -> &str {
        &self.config.local_region
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}
