//! Peer state and HTTP transport to remote regions.
//!
//! One [`PeerConnection`] exists per configured peer for the lifetime of the
//! process. Its state is volatile: nothing here survives a restart, and
//! nothing needs to, because the durable `synced_to` sets in the change log
//! are what drive outbound replication.
//!
//! # Single-writer fields
//!
//! Each field has exactly one writer. Readers (query router, status
//! reporting) take lock-free snapshot reads.
//!
//! | Field | Writer |
//! |-------|--------|
//! | `reachable`, `unreachable_since`, `last_success` | partition detector probe loop |
//! | `failure_count`, `cursor`, `last_push` | this peer's outbound loop |
//!
//! # Transport
//!
//! Every call carries its own timeout: pushes use the outbound request
//! timeout, probes the (much shorter) probe timeout, and fan-out reads the
//! query timeout. A timeout is reported as a retryable
//! [`ReplicationError::PeerConnection`], never a panic.

use crate::config::{PeerConfig, SyncSettings};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::record::{Record, RecordQuery};
use crate::wire::{millis_to_utc, PeerStatus, RecordsResponse, SyncAck, SyncBatch};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A remote region: its transport plus volatile peer state.
pub struct PeerConnection {
    /// Peer configuration
    pub config: PeerConfig,
    client: Client,
    request_timeout: Duration,
    probe_timeout: Duration,
    fanout_timeout: Duration,

    /// Probe loop: last probe succeeded (optimistically true before the first probe)
    reachable: AtomicBool,
    /// Probe loop: epoch millis of the first failed probe in the current outage (0 = none)
    unreachable_since: AtomicU64,
    /// Probe loop: epoch millis of the last successful probe (0 = never)
    last_success: AtomicU64,

    /// Outbound loop: consecutive failed pushes
    failure_count: AtomicU64,
    /// Outbound loop: last sequence confirmed sent
    cursor: AtomicU64,
    /// Outbound loop: epoch millis of the last acknowledged push (0 = never)
    last_push: AtomicU64,
}

impl PeerConnection {
    /// Create peer state with a shared HTTP client.
    pub fn new(config: PeerConfig, settings: &SyncSettings, client: Client) -> Self {
        Self {
            config,
            client,
            request_timeout: settings.outbound.request_timeout_duration(),
            probe_timeout: settings.probe.timeout_duration(),
            fanout_timeout: settings.query.fanout_timeout_duration(),
            reachable: AtomicBool::new(true),
            unreachable_since: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            cursor: AtomicU64::new(0),
            last_push: AtomicU64::new(0),
        }
    }

    /// Get the peer's region id.
    pub fn region_id(&self) -> &str {
        &self.config.region_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn transport_error(&self, operation: &str, e: reqwest::Error) -> ReplicationError {
        let message = if e.is_timeout() {
            format!("{} timed out", operation)
        } else if e.is_connect() {
            format!("{} connection failed: {}", operation, e)
        } else if let Some(status) = e.status() {
            format!("{} returned {}", operation, status)
        } else {
            format!("{} failed: {}", operation, e)
        };
        ReplicationError::peer(&self.config.region_id, message)
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Push a batch to the peer's inbound sync endpoint.
    pub async fn push(&self, batch: &SyncBatch) -> Result<SyncAck> {
        let start = Instant::now();
        let response = self
            .client
            .post(self.url("/internal/sync"))
            .timeout(self.request_timeout)
            .json(batch)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.transport_error("push", e))?;

        let ack: SyncAck = response
            .json()
            .await
            .map_err(|e| self.transport_error("push ack decode", e))?;

        metrics::record_peer_operation_latency(&self.config.region_id, "push", start.elapsed());
        Ok(ack)
    }

    /// Lightweight liveness check. Returns the round-trip latency.
    pub async fn probe(&self) -> Result<Duration> {
        let start = Instant::now();
        self.client
            .get(self.url("/health"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.transport_error("probe", e))?;
        Ok(start.elapsed())
    }

    /// Read records from the peer for a scatter-gather query.
    pub async fn fetch_records(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let start = Instant::now();
        let response = self
            .client
            .get(self.url("/internal/records"))
            .timeout(self.fanout_timeout)
            .query(query)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.transport_error("fetch_records", e))?;

        let body: RecordsResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error("fetch_records decode", e))?;

        metrics::record_peer_operation_latency(&self.config.region_id, "fetch_records", start.elapsed());
        Ok(body.records)
    }

    // =========================================================================
    // Probe loop writes
    // =========================================================================

    /// Record a probe outcome observed at `now_ms`.
    ///
    /// Returns `true` if reachability changed.
    pub fn record_probe(&self, ok: bool, now_ms: u64) -> bool {
        let was_reachable = self.reachable.swap(ok, Ordering::AcqRel);
        if ok {
            self.unreachable_since.store(0, Ordering::Release);
            self.last_success.store(now_ms, Ordering::Release);
        } else if was_reachable {
            self.unreachable_since.store(now_ms, Ordering::Release);
        }

        let changed = was_reachable != ok;
        if changed {
            if ok {
                info!(peer_id = %self.config.region_id, "Peer reachable");
            } else {
                warn!(peer_id = %self.config.region_id, "Peer unreachable");
            }
            metrics::record_peer_state(&self.config.region_id, ok);
        }
        changed
    }

    // =========================================================================
    // Outbound loop writes
    // =========================================================================

    /// Record an acknowledged push up to `cursor`.
    pub fn record_push_success(&self, cursor: u64) {
        self.failure_count.store(0, Ordering::Release);
        self.cursor.fetch_max(cursor, Ordering::AcqRel);
        self.last_push.store(epoch_millis(), Ordering::Release);
    }

    /// Record a failed push. Returns the new consecutive failure count.
    pub fn record_push_failure(&self) -> u64 {
        self.failure_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    // =========================================================================
    // Snapshot reads
    // =========================================================================

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Get consecutive push failure count.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Epoch millis of the last successful probe.
    pub fn last_successful_contact(&self) -> Option<u64> {
        match self.last_success.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Epoch millis when the current outage began.
    pub fn unreachable_since(&self) -> Option<u64> {
        match self.unreachable_since.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Get milliseconds since last successful probe.
    pub fn millis_since_success(&self) -> u64 {
        match self.last_successful_contact() {
            None => u64::MAX,
            Some(last) => epoch_millis().saturating_sub(last),
        }
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            region_id: self.config.region_id.clone(),
            base_url: self.config.base_url.clone(),
            reachable: self.is_reachable(),
            last_successful_contact: self
                .last_successful_contact()
                .and_then(|ms| millis_to_utc(ms as i64)),
            consecutive_failures: self.failure_count(),
            cursor: self.cursor(),
        }
    }
}

/// Manager for all peer connections.
pub struct PeerManager {
    /// All peers (keyed by region_id)
    peers: dashmap::DashMap<String, Arc<PeerConnection>>,
    client: Client,
    settings: SyncSettings,
}

impl PeerManager {
    /// Create a peer manager with one shared HTTP client.
    pub fn new(settings: &SyncSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.probe.timeout_duration())
            .build()
            .map_err(|e| ReplicationError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            peers: dashmap::DashMap::new(),
            client,
            settings: settings.clone(),
        })
    }

    /// Add a peer from configuration.
    pub fn add_peer(&self, config: PeerConfig) {
        let region_id = config.region_id.clone();
        debug!(peer_id = %region_id, base_url = %config.base_url, "Adding peer");
        let conn = Arc::new(PeerConnection::new(config, &self.settings, self.client.clone()));
        self.peers.insert(region_id, conn);
    }

    /// Get a peer by region id.
    pub fn get(&self, region_id: &str) -> Option<Arc<PeerConnection>> {
        self.peers.get(region_id).map(|r| r.value().clone())
    }

    /// All peers, ordered by region id.
    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        let mut peers: Vec<_> = self.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.config.region_id.cmp(&b.config.region_id));
        peers
    }

    /// Peers whose last probe succeeded.
    pub fn reachable(&self) -> Vec<Arc<PeerConnection>> {
        self.all().into_iter().filter(|p| p.is_reachable()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Get count of reachable peers.
    pub fn connected_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_reachable()).count()
    }
}

/// Get current epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(region: &str) -> PeerConnection {
        PeerConnection::new(
            PeerConfig::for_testing(region, "http://127.0.0.1:1"),
            &SyncSettings::default(),
            Client::new(),
        )
    }

    #[test]
    fn test_peer_initial_state() {
        let p = peer("eu-west");
        assert_eq!(p.region_id(), "eu-west");
        assert!(p.is_reachable());
        assert_eq!(p.failure_count(), 0);
        assert_eq!(p.cursor(), 0);
        assert!(p.last_successful_contact().is_none());
        assert_eq!(p.millis_since_success(), u64::MAX);
    }

    #[test]
    fn test_probe_transitions() {
        let p = peer("eu-west");

        assert!(p.record_probe(false, 1_000));
        assert_eq!(p.unreachable_since(), Some(1_000));

        // Still down: outage start is kept
        assert!(!p.record_probe(false, 2_000));
        assert_eq!(p.unreachable_since(), Some(1_000));

        assert!(p.record_probe(true, 3_000));
        assert!(p.is_reachable());
        assert_eq!(p.unreachable_since(), None);
        assert_eq!(p.last_successful_contact(), Some(3_000));
    }

    #[test]
    fn test_push_counters() {
        let p = peer("eu-west");
        assert_eq!(p.record_push_failure(), 1);
        assert_eq!(p.record_push_failure(), 2);
        p.record_push_success(10);
        assert_eq!(p.failure_count(), 0);
        assert_eq!(p.cursor(), 10);
        // Cursor never moves backwards
        p.record_push_success(4);
        assert_eq!(p.cursor(), 10);
    }

    #[test]
    fn test_status_snapshot() {
        let p = peer("eu-west");
        p.record_probe(true, 1_700_000_000_000);
        p.record_push_failure();
        let status = p.status();
        assert_eq!(status.region_id, "eu-west");
        assert!(status.reachable);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(
            status.last_successful_contact.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_url_join() {
        let p = PeerConnection::new(
            PeerConfig {
                region_id: "x".into(),
                base_url: "http://host:8080/".into(),
            },
            &SyncSettings::default(),
            Client::new(),
        );
        assert_eq!(p.url("/health"), "http://host:8080/health");
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_retryable_error() {
        let p = peer("eu-west");
        let err = p.probe().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("eu-west"));
    }

    #[test]
    fn test_manager_add_and_filter() {
        let manager = PeerManager::new(&SyncSettings::default()).unwrap();
        manager.add_peer(PeerConfig::for_testing("b", "http://b:1"));
        manager.add_peer(PeerConfig::for_testing("a", "http://a:1"));

        let ids: Vec<_> = manager.all().iter().map(|p| p.region_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(manager.connected_count(), 2);

        manager.get("a").unwrap().record_probe(false, 1);
        assert_eq!(manager.reachable().len(), 1);
        assert_eq!(manager.connected_count(), 1);
        assert_eq!(manager.len(), 2);
        assert!(!manager.is_empty());
    }
}
