//! Outbound path: one replication loop per peer.
//!
//! Each tick the loop:
//! 1. Reads change log entries whose `synced_to` lacks the peer (ascending)
//! 2. Pushes them as one batch to the peer's inbound endpoint
//! 3. On acknowledgement, records the peer in each entry's `synced_to`
//! 4. Repeats while batches come back full, so a backlog drains in one tick
//!
//! A failed push leaves the entries unmarked; the next tick re-sends them.
//! There is no separate retry queue: the durable `synced_to` sets are the
//! cursor, so a restart resumes exactly where acknowledgements stopped.
//!
//! # Graceful Shutdown
//!
//! The loop checks the shutdown signal between batches and while waiting for
//! the next tick. An in-flight push is allowed to finish (it is bounded by
//! the request timeout) so its acknowledgement is not lost.

use crate::config::OutboundConfig;
use crate::error::Result;
use crate::metrics;
use crate::peer::PeerConnection;
use crate::store::RegionStore;
use crate::wire::SyncBatch;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// Batches acknowledged by the peer.
    pub batches: usize,
    /// Entries acknowledged by the peer.
    pub entries: usize,
}

/// Run the outbound loop for a single peer until shutdown is signaled.
pub async fn run_outbound<S: RegionStore>(
    peer: Arc<PeerConnection>,
    store: Arc<S>,
    local_region: String,
    config: OutboundConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let peer_id = peer.region_id().to_string();
    let span = info_span!("outbound", peer_id = %peer_id);

    async move {
        info!(
            interval_ms = config.interval_duration().as_millis() as u64,
            batch_size = config.batch_size,
            "Starting outbound loop"
        );

        let mut interval = time::interval(config.interval_duration());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match drain_pending(&peer, store.as_ref(), &local_region, config.batch_size, &shutdown_rx).await {
                        Ok(result) if result.entries > 0 => {
                            debug!(batches = result.batches, entries = result.entries, "Drained pending entries");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let failures = peer.record_push_failure();
                            if e.is_retryable() {
                                warn!(error = %e, consecutive_failures = failures, "Push failed, will retry next tick");
                            } else {
                                warn!(error = %e, consecutive_failures = failures, "Outbound pass failed");
                            }
                        }
                    }
                    metrics::set_peer_failures(&peer_id, peer.failure_count());
                }
            }
        }

        info!("Outbound loop stopped");
    }
    .instrument(span)
    .await
}

/// Push everything the peer has not acknowledged, one batch at a time.
///
/// Stops at the first failed push, at a short batch (backlog drained), or
/// when shutdown is signaled between batches.
pub async fn drain_pending<S: RegionStore + ?Sized>(
    peer: &PeerConnection,
    store: &S,
    local_region: &str,
    batch_size: usize,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<DrainResult> {
    let mut result = DrainResult::default();

    loop {
        let entries = store.unsent_for(peer.region_id(), batch_size).await?;
        if entries.is_empty() {
            return Ok(result);
        }

        let batch = SyncBatch::from_entries(local_region, &entries)?;
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        let max_sequence = sequences.iter().copied().max().unwrap_or(0);

        let start = Instant::now();
        let pushed = peer.push(&batch).await;
        metrics::record_push(peer.region_id(), entries.len(), pushed.is_ok(), start.elapsed());
        let ack = pushed?;

        if ack.rejected > 0 {
            warn!(
                peer_id = %peer.region_id(),
                rejected = ack.rejected,
                "Peer rejected entries as malformed"
            );
        }

        store.mark_synced(&sequences, peer.region_id()).await?;
        peer.record_push_success(max_sequence);

        result.batches += 1;
        result.entries += entries.len();

        if entries.len() < batch_size || *shutdown_rx.borrow() {
            return Ok(result);
        }
    }
}
