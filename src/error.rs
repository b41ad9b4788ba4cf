// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for region sync.
//!
//! Errors are categorized by where they come from (local store, peer
//! transport, wire input) and carry enough context to debug a failed
//! replication round from logs alone.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `PeerConnection` | Yes | Peer unreachable, timed out, or answered non-success |
//! | `Store` | No | Local change log / record store failure (fails the write) |
//! | `StaleWrite` | No | Explicit client timestamp older than the stored version |
//! | `MalformedEntry` | No | Replicated entry could not be decoded |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Retryable errors are never retried inline. The outbound loop leaves the
//! affected entries unsynced and picks them up again on its next tick.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors raised by the local record store and change log.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite failure (after busy retries were exhausted).
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Payload could not be encoded or decoded.
    #[error("Payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored row failed to decode into a domain type.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Errors that can occur during cross-region sync.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Local store failure.
    ///
    /// Fatal to the write that triggered it. A client write whose change
    /// log append fails is reported to the caller as failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Peer transport failure.
    ///
    /// Covers connection refusal, timeouts and non-success responses.
    /// Retried on the next scheduled tick.
    #[error("Peer connection error ({peer_id}): {message}")]
    PeerConnection { peer_id: String, message: String },

    /// A local write carried an explicit timestamp that loses to the
    /// version already stored.
    #[error("Stale write for {record_id}: attempted {attempted}, stored {current}")]
    StaleWrite {
        record_id: String,
        attempted: i64,
        current: i64,
    },

    /// A replicated entry could not be decoded.
    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation (e.g. `start()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Build a peer error from any displayable cause.
    pub fn peer(peer_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::PeerConnection {
            peer_id: peer_id.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PeerConnection { .. } => true,
            Self::Store(_) => false, // Local DB issues need attention
            Self::StaleWrite { .. } => false,
            Self::MalformedEntry(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<sqlx::Error> for ReplicationError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}
