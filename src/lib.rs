//! # Region Sync
//!
//! Cross-region synchronization for a geo-partitioned data store that must
//! keep working locally when inter-region links fail.
//!
//! ## Architecture
//!
//! Each region runs one [`SyncEngine`] over its local store. Every mutation
//! lands in a durable change log together with the set of regions known to
//! hold it; background loops push what each peer is missing:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               region-sync                                 │
//! │                                                                           │
//! │  write_local ──┐   ┌────────────────────┐   ┌──────────────────────────┐  │
//! │                ├──►│ RegionStore        │──►│ outbound loop (per peer) │──┼──► peer
//! │  POST /sync ───┘   │ records + change   │   │ unsent_for / mark_synced │  │
//! │  (inbound, LWW)    │ log + synced_to    │   └──────────────────────────┘  │
//! │                    └────────────────────┘                                 │
//! │                                                                           │
//! │  ┌───────────────────┐  watch   ┌──────────────────────────────────────┐  │
//! │  │ PartitionDetector │─────────►│ QueryRouter (local / scatter-gather) │  │
//! │  │ (probe every peer)│          └──────────────────────────────────────┘  │
//! │  └───────────────────┘                                                    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: an entry is re-sent until the peer
//!   acknowledges it, across restarts.
//! - **Convergence**: conflicts resolve by last-write-wins on the whole
//!   document, ties broken by region id, so every region picks the same
//!   winner regardless of delivery order.
//! - **Island mode**: once every peer has been unreachable for the grace
//!   period, all-regions reads quietly narrow to local data. Writes are
//!   never blocked by peer connectivity.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use region_sync::{http, LocalWrite, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::from_env()?;
//!     let engine = Arc::new(SyncEngine::open(config).await?);
//!     engine.start().await?;
//!
//!     engine
//!         .write_local(LocalWrite::insert("post-1", serde_json::json!({"title": "hi"})))
//!         .await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     let shutdown = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!     http::serve(Arc::clone(&engine), listener, shutdown).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod change_log;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod inbound;
pub mod metrics;
pub mod partition;
pub mod peer;
pub mod record;
pub mod resolver;
pub mod router;
pub mod store;
pub mod wire;

// Re-exports for convenience
pub use change_log::SqliteStore;
pub use config::{ChangeLogConfig, OutboundConfig, PeerConfig, ProbeConfig, QueryConfig, SyncConfig, SyncSettings};
pub use coordinator::{EngineState, LocalWrite, SyncEngine, WriteReceipt};
pub use error::{ReplicationError, Result, StoreError};
pub use partition::{IsolationState, IsolationTracker, PartitionDetector};
pub use peer::{PeerConnection, PeerManager};
pub use record::{ChangeEntry, Operation, Record, RecordQuery, Version};
pub use resolver::{resolve, ConflictSummary, Resolution};
pub use router::{QueryResult, QueryRouter, QueryScope};
pub use store::{AppendOutcome, MemoryStore, RegionStore};
pub use wire::{StatusReport, SyncAck, SyncBatch};
