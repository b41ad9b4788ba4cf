//! Partition ("island mode") detection.
//!
//! Each peer is either `REACHABLE` or `UNREACHABLE`, driven by a liveness
//! probe on its own interval:
//!
//! ```text
//!            probe fails
//! REACHABLE ─────────────▶ UNREACHABLE
//!     ▲                         │
//!     └──────── probe ok ───────┘
//! ```
//!
//! The region is isolated (`active`) only once **every** configured peer has
//! been continuously unreachable for the grace period (60s by default). It
//! stops being isolated on the first successful probe of **any** peer. A
//! single missed probe therefore never flips the region into island mode.
//!
//! The decision logic lives in [`IsolationTracker`], a pure state machine
//! fed `(peer, ok, at)` observations. [`PartitionDetector`] is the only
//! writer: its probe loop owns the tracker and publishes snapshots on a
//! `watch` channel, so readers never contend with it.

use crate::config::ProbeConfig;
use crate::metrics;
use crate::peer::{epoch_millis, PeerManager};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Region-wide isolation snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationState {
    pub active: bool,
    /// Epoch millis when isolation began.
    pub isolation_start: Option<i64>,
    pub connected_count: usize,
    pub total_peers: usize,
}

impl IsolationState {
    /// Snapshot for a freshly started region: not isolated, every peer
    /// assumed reachable until probed.
    pub fn initial(total_peers: usize) -> Self {
        Self {
            active: false,
            isolation_start: None,
            connected_count: total_peers,
            total_peers,
        }
    }
}

/// Result of [`IsolationTracker::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Entered,
    Left,
}

/// Pure island-mode state machine.
#[derive(Debug, Clone)]
pub struct IsolationTracker {
    grace: Duration,
    /// peer -> start of the current outage (None = reachable)
    unreachable_since: HashMap<String, Option<Instant>>,
    isolated_at: Option<Instant>,
}

impl IsolationTracker {
    pub fn new<I, P>(peers: I, grace: Duration) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            grace,
            unreachable_since: peers.into_iter().map(|p| (p.into(), None)).collect(),
            isolated_at: None,
        }
    }

    /// Feed one probe result. Unknown peers are ignored.
    pub fn observe(&mut self, peer: &str, ok: bool, at: Instant) {
        if let Some(since) = self.unreachable_since.get_mut(peer) {
            if ok {
                *since = None;
            } else if since.is_none() {
                *since = Some(at);
            }
        }
    }

    /// Re-derive the aggregate state at `at`.
    pub fn evaluate(&mut self, at: Instant) -> Transition {
        let all_past_grace = !self.unreachable_since.is_empty()
            && self.unreachable_since.values().all(|since| {
                since.map_or(false, |s| at.saturating_duration_since(s) >= self.grace)
            });

        match (self.isolated_at.is_some(), all_past_grace) {
            (false, true) => {
                self.isolated_at = Some(at);
                Transition::Entered
            }
            (true, false) => {
                self.isolated_at = None;
                Transition::Left
            }
            _ => Transition::Unchanged,
        }
    }

    pub fn is_active(&self) -> bool {
        self.isolated_at.is_some()
    }

    pub fn isolated_at(&self) -> Option<Instant> {
        self.isolated_at
    }

    pub fn connected_count(&self) -> usize {
        self.unreachable_since.values().filter(|s| s.is_none()).count()
    }

    pub fn total_peers(&self) -> usize {
        self.unreachable_since.len()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }
}

/// Probes every peer on a fixed interval and publishes [`IsolationState`].
pub struct PartitionDetector {
    peers: Arc<PeerManager>,
    config: ProbeConfig,
    state_tx: watch::Sender<IsolationState>,
}

impl PartitionDetector {
    pub fn new(peers: Arc<PeerManager>, config: ProbeConfig) -> Self {
        let (state_tx, _) = watch::channel(IsolationState::initial(peers.len()));
        Self {
            peers,
            config,
            state_tx,
        }
    }

    /// Subscribe to isolation snapshots.
    pub fn subscribe(&self) -> watch::Receiver<IsolationState> {
        self.state_tx.subscribe()
    }

    /// Current snapshot.
    pub fn current(&self) -> IsolationState {
        self.state_tx.borrow().clone()
    }

    pub fn new_tracker(&self) -> IsolationTracker {
        IsolationTracker::new(
            self.peers.all().iter().map(|p| p.region_id().to_string()),
            self.config.isolation_grace_duration(),
        )
    }

    /// Background probe loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut tracker = self.new_tracker();
        let mut interval = time::interval(self.config.interval_duration());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            peers = tracker.total_peers(),
            interval_ms = self.config.interval_duration().as_millis() as u64,
            grace_secs = tracker.grace().as_secs(),
            "Starting partition detector"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Partition detector stopping");
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.probe_once(&mut tracker).await;
                }
            }
        }
    }

    /// Probe every peer in parallel, update peer state, re-evaluate, publish.
    pub async fn probe_once(&self, tracker: &mut IsolationTracker) -> Transition {
        let peers = self.peers.all();
        let results = join_all(peers.iter().map(|peer| async move {
            let result = peer.probe().await;
            (peer, result)
        }))
        .await;

        let at = Instant::now();
        let now_ms = epoch_millis();
        for (peer, result) in results {
            let ok = match result {
                Ok(latency) => {
                    metrics::record_peer_probe(peer.region_id(), true, Some(latency));
                    true
                }
                Err(e) => {
                    debug!(peer_id = %peer.region_id(), error = %e, "Probe failed");
                    metrics::record_peer_probe(peer.region_id(), false, None);
                    false
                }
            };
            peer.record_probe(ok, now_ms);
            tracker.observe(peer.region_id(), ok, at);
        }

        let transition = tracker.evaluate(at);
        self.publish(tracker, transition);
        transition
    }

    fn publish(&self, tracker: &IsolationTracker, transition: Transition) {
        let previous_start = self.state_tx.borrow().isolation_start;
        let isolation_start = match transition {
            Transition::Entered => Some(epoch_millis() as i64),
            Transition::Left => None,
            Transition::Unchanged => previous_start,
        };

        match transition {
            Transition::Entered => warn!(
                total_peers = tracker.total_peers(),
                grace_secs = tracker.grace().as_secs(),
                "All peers unreachable past grace period, entering island mode"
            ),
            Transition::Left => info!(
                connected = tracker.connected_count(),
                "Peer reachable again, leaving island mode"
            ),
            Transition::Unchanged => {}
        }

        let state = IsolationState {
            active: tracker.is_active(),
            isolation_start,
            connected_count: tracker.connected_count(),
            total_peers: tracker.total_peers(),
        };
        metrics::set_island_mode(state.active, state.connected_count);
        self.state_tx.send_replace(state);
    }
}
