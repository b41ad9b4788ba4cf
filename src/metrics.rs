//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Peer reachability and probe latency
//! - Outbound pushes and acknowledgements
//! - Inbound apply outcomes
//! - Conflict resolution outcomes
//! - Island mode
//! - Scatter-gather reads
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `region_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use region_sync::metrics;
//! use std::time::Duration;
//!
//! // In the outbound loop after a push
//! metrics::record_push("eu-west", 42, true, Duration::from_millis(30));
//!
//! // In the partition detector after a probe
//! metrics::record_peer_probe("eu-west", false, None);
//! ```

use crate::resolver::ConflictOutcome;
use crate::router::QueryScope;
use crate::wire::SyncAck;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Peer Metrics
// =============================================================================

/// Record a peer reachability change (1 = reachable, 0 = unreachable).
pub fn record_peer_state(peer_id: &str, reachable: bool) {
    gauge!("region_sync_peer_reachable", "peer_id" => peer_id.to_string())
        .set(if reachable { 1.0 } else { 0.0 });
}

/// Record a liveness probe result.
pub fn record_peer_probe(peer_id: &str, success: bool, latency: Option<Duration>) {
    let status = if success { "success" } else { "failure" };
    counter!("region_sync_probes_total", "peer_id" => peer_id.to_string(), "status" => status).increment(1);
    if let Some(latency) = latency {
        histogram!("region_sync_probe_latency_seconds", "peer_id" => peer_id.to_string())
            .record(latency.as_secs_f64());
    }
}

/// Record latency of a peer request (push, fetch_records).
pub fn record_peer_operation_latency(peer_id: &str, operation: &str, duration: Duration) {
    histogram!(
        "region_sync_peer_operation_seconds",
        "peer_id" => peer_id.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Gauge for consecutive push failures to a peer.
pub fn set_peer_failures(peer_id: &str, failures: u64) {
    gauge!("region_sync_peer_consecutive_failures", "peer_id" => peer_id.to_string()).set(failures as f64);
}

// =============================================================================
// Replication Metrics
// =============================================================================

/// Record an outbound push attempt.
pub fn record_push(peer_id: &str, entries: usize, success: bool, duration: Duration) {
    let peer = peer_id.to_string();
    let status = if success { "success" } else { "failure" };

    counter!("region_sync_pushes_total", "peer_id" => peer.clone(), "status" => status).increment(1);
    if success {
        counter!("region_sync_entries_acked_total", "peer_id" => peer.clone()).increment(entries as u64);
    }
    histogram!("region_sync_push_batch_size", "peer_id" => peer.clone()).record(entries as f64);
    histogram!("region_sync_push_duration_seconds", "peer_id" => peer).record(duration.as_secs_f64());
}

/// Record an applied inbound batch.
pub fn record_inbound_batch(source: &str, ack: &SyncAck, duration: Duration) {
    let source = source.to_string();

    counter!("region_sync_inbound_applied_total", "source" => source.clone()).increment(ack.applied as u64);
    counter!("region_sync_inbound_superseded_total", "source" => source.clone())
        .increment(ack.superseded as u64);
    if ack.rejected > 0 {
        counter!("region_sync_inbound_rejected_total", "source" => source.clone())
            .increment(ack.rejected as u64);
    }
    histogram!("region_sync_inbound_duration_seconds", "source" => source).record(duration.as_secs_f64());
}

/// Record a resolved conflict.
pub fn record_conflict(outcome: ConflictOutcome) {
    let outcome = match outcome {
        ConflictOutcome::RemoteWins => "remote_wins",
        ConflictOutcome::LocalWins => "local_wins",
    };
    counter!("region_sync_conflicts_total", "outcome" => outcome).increment(1);
}

/// Record a local write.
pub fn record_local_write(operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "region_sync_local_writes_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a SQLite busy retry.
pub fn store_retries_total(operation: &str) {
    counter!("region_sync_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Partition Metrics
// =============================================================================

/// Island mode gauge plus connected peer count.
pub fn set_island_mode(active: bool, connected_peers: usize) {
    gauge!("region_sync_island_mode").set(if active { 1.0 } else { 0.0 });
    gauge!("region_sync_connected_peers").set(connected_peers as f64);
}

// =============================================================================
// Query Metrics
// =============================================================================

/// Record a routed read.
pub fn record_query(scope: QueryScope, degraded: bool) {
    let scope = match scope {
        QueryScope::LocalOnly => "local_only",
        QueryScope::AllRegions => "all_regions",
    };
    counter!("region_sync_queries_total", "scope" => scope, "degraded" => degraded.to_string()).increment(1);
}

/// Record one peer's part in a fan-out read.
pub fn record_fanout(peer_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("region_sync_fanout_total", "peer_id" => peer_id.to_string(), "status" => status).increment(1);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("region_sync_engine_state").set(value);
}
