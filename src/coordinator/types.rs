//! Engine state and local-write types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (change log open, loops spawned)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────────── ShuttingDown
//!
//! Starting ──(startup error)──→ Failed
//! ```
//!
//! - **Created**: after `SyncEngine::new()`. Inbound batches and local
//!   writes are already accepted; nothing is pushed yet.
//! - **Starting**: `start()` called, spawning outbound loops and the
//!   partition detector.
//! - **Running**: normal operation.
//! - **ShuttingDown**: `shutdown()` called. Loops are finishing their
//!   in-flight push.
//! - **Stopped**: all loops have exited.
//! - **Failed**: startup failed. Check logs.

use crate::record::Operation;
use serde_json::Value;

/// State of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,

    /// Spawning outbound loops and the partition detector.
    Starting,

    /// Running and replicating.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Stopped.
    ///
    /// All background tasks have exited. Safe to drop.
    Stopped,

    /// Failed to start.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// A mutation made by an application in the local region.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    pub operation: Operation,
    pub record_id: String,
    pub payload: Value,
    /// Explicit logical timestamp (epoch millis). `None` stamps the write
    /// with the wall clock, bumped past the stored version if needed.
    pub timestamp: Option<i64>,
}

impl LocalWrite {
    pub fn insert(record_id: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: Operation::Insert,
            record_id: record_id.into(),
            payload,
            timestamp: None,
        }
    }

    pub fn update(record_id: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: Operation::Update,
            ..Self::insert(record_id, payload)
        }
    }

    pub fn delete(record_id: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            ..Self::insert(record_id, Value::Null)
        }
    }

    /// Stamp the write with an explicit timestamp.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Where a local write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub sequence: u64,
    pub timestamp: i64,
}
