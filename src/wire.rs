// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire types for peer-to-peer sync and status reporting.
//!
//! # Entry decoding
//!
//! A [`SyncBatch`] carries its entries as raw JSON values. Each one is
//! decoded separately by [`decode_entry`], so one malformed entry is logged
//! and dropped while the rest of the batch still applies.
//!
//! ```json
//! {
//!   "source_region": "eu-west",
//!   "operations": [
//!     {"sequence": 17, "operation": "update", "record_id": "post-9",
//!      "payload": {"body": "..."}, "timestamp": 1718000000000,
//!      "region_origin": "eu-west", "record_origin": "us-east"}
//!   ]
//! }
//! ```
//!
//! `record_origin` is optional and defaults to `region_origin`. Any
//! `synced_to` sent by the peer is ignored; the receiver decides what it
//! records.

use crate::error::{ReplicationError, Result};
use crate::record::{ChangeEntry, Operation, Record};
use crate::resolver::ConflictSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Batch pushed to `POST /internal/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Region that sent (relayed) this batch.
    pub source_region: String,
    #[serde(default)]
    pub operations: Vec<Value>,
}

impl SyncBatch {
    pub fn from_entries(source_region: &str, entries: &[ChangeEntry]) -> Result<Self> {
        let operations = entries
            .iter()
            .map(encode_entry)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ReplicationError::Internal(format!("Failed to encode entry: {}", e)))?;
        Ok(Self {
            source_region: source_region.to_string(),
            operations,
        })
    }
}

/// Per-batch acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    pub received: usize,
    pub applied: usize,
    /// Lost resolution (or replayed); acknowledged without mutation.
    pub superseded: usize,
    /// Malformed; dropped.
    pub rejected: usize,
}

/// Encode an entry for the wire.
pub fn encode_entry(entry: &ChangeEntry) -> serde_json::Result<Value> {
    serde_json::to_value(entry)
}

fn field<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    obj.get(name)
        .ok_or_else(|| ReplicationError::MalformedEntry(format!("missing field '{}'", name)))
}

fn string_field(obj: &Map<String, Value>, name: &str) -> Result<String> {
    match field(obj, name)? {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) => Err(ReplicationError::MalformedEntry(format!("empty field '{}'", name))),
        other => Err(ReplicationError::MalformedEntry(format!(
            "field '{}' must be a string, got {}",
            name, other
        ))),
    }
}

fn int_field(obj: &Map<String, Value>, name: &str) -> Result<i64> {
    field(obj, name)?
        .as_i64()
        .ok_or_else(|| ReplicationError::MalformedEntry(format!("field '{}' must be an integer", name)))
}

/// Decode one wire entry, validating every field.
pub fn decode_entry(raw: &Value) -> Result<ChangeEntry> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ReplicationError::MalformedEntry("entry is not an object".into()))?;

    let operation_str = string_field(obj, "operation")?;
    let operation: Operation = operation_str
        .parse()
        .map_err(ReplicationError::MalformedEntry)?;

    let record_id = string_field(obj, "record_id")?;
    let region_origin = string_field(obj, "region_origin")?;
    let record_origin = match obj.get("record_origin") {
        None | Some(Value::Null) => region_origin.clone(),
        Some(_) => string_field(obj, "record_origin")?,
    };

    let sequence = int_field(obj, "sequence")?;
    if sequence < 0 {
        return Err(ReplicationError::MalformedEntry(format!("negative sequence {}", sequence)));
    }
    let timestamp = int_field(obj, "timestamp")?;

    let payload = match (operation, obj.get("payload")) {
        (Operation::Delete, None) => Value::Null,
        (_, Some(payload)) => payload.clone(),
        (_, None) => {
            return Err(ReplicationError::MalformedEntry(format!(
                "{} for '{}' has no payload",
                operation, record_id
            )))
        }
    };

    Ok(ChangeEntry {
        sequence: sequence as u64,
        operation,
        record_id,
        payload,
        timestamp,
        region_origin,
        record_origin,
        synced_to: BTreeSet::new(),
    })
}

// =============================================================================
// Read-side payloads
// =============================================================================

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub region: String,
}

/// Body of `GET /internal/records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsResponse {
    pub region: String,
    pub records: Vec<Record>,
}

/// Body of `GET /internal/changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub region: String,
    pub operations: Vec<ChangeEntry>,
}

// =============================================================================
// Status report
// =============================================================================

/// Aggregate isolation view exposed to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandModeStatus {
    pub active: bool,
    pub isolation_start: Option<DateTime<Utc>>,
    pub isolation_duration_seconds: Option<u64>,
    pub threshold_seconds: u64,
    pub connected_count: usize,
    pub total_peers: usize,
}

/// One peer's reachability and replication progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub region_id: String,
    pub base_url: String,
    pub reachable: bool,
    pub last_successful_contact: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    /// Last sequence confirmed sent to this peer.
    pub cursor: u64,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub region: String,
    pub engine_state: String,
    pub island_mode: IslandModeStatus,
    pub peers: Vec<PeerStatus>,
    pub conflicts: ConflictSummary,
    pub change_log_head: u64,
}

/// Convert epoch millis to a UTC timestamp (0 and out-of-range map to `None`).
pub fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis)
}
