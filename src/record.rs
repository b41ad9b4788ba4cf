//! Records, change log entries and the version view used for resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Current wall clock as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Kind of mutation carried by a change log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Whether applying this operation leaves a tombstone.
    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// The comparable identity of one stored or incoming version.
///
/// `region` is the region whose mutation produced the version, which is
/// what ties are broken on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: i64,
    pub region: String,
    pub deleted: bool,
}

impl Version {
    pub fn new(timestamp: i64, region: impl Into<String>, deleted: bool) -> Self {
        Self {
            timestamp,
            region: region.into(),
            deleted,
        }
    }
}

/// A record as stored in one region.
///
/// A deleted record is kept as a tombstone so a late, older update cannot
/// resurrect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: String,
    /// Region where the record was first created.
    pub region_origin: String,
    /// Region whose mutation produced the stored version.
    pub modified_in: String,
    /// Logical write time, epoch milliseconds.
    pub last_modified: i64,
    pub payload: Value,
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    pub fn version(&self) -> Version {
        Version::new(self.last_modified, self.modified_in.clone(), self.deleted)
    }
}

/// One mutation in a region's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Local, monotonically increasing position.
    pub sequence: u64,
    pub operation: Operation,
    pub record_id: String,
    /// Full document snapshot.
    pub payload: Value,
    /// The record's `last_modified` at the time of this mutation.
    pub timestamp: i64,
    /// Region that produced the mutation; unchanged as the entry relays.
    pub region_origin: String,
    /// Region where the record was first created.
    pub record_origin: String,
    /// Regions known to have this entry.
    #[serde(default)]
    pub synced_to: BTreeSet<String>,
}

impl ChangeEntry {
    pub fn version(&self) -> Version {
        Version::new(self.timestamp, self.region_origin.clone(), self.operation.is_delete())
    }
}

/// A mutation to apply to the local store and log, atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub operation: Operation,
    pub record_id: String,
    pub payload: Value,
    pub timestamp: i64,
    /// Region that produced the mutation.
    pub region_origin: String,
    /// Creator region, used when the record does not exist locally yet.
    pub record_origin: String,
    /// Regions to record as already holding the resulting entry.
    pub synced_to: BTreeSet<String>,
}

impl Mutation {
    pub fn version(&self) -> Version {
        Version::new(self.timestamp, self.region_origin.clone(), self.operation.is_delete())
    }

    /// The record this mutation produces, given what is stored now.
    pub fn to_record(&self, current: Option<&Record>) -> Record {
        Record {
            record_id: self.record_id.clone(),
            region_origin: current
                .map(|r| r.region_origin.clone())
                .unwrap_or_else(|| self.record_origin.clone()),
            modified_in: self.region_origin.clone(),
            last_modified: self.timestamp,
            payload: self.payload.clone(),
            deleted: self.operation.is_delete(),
        }
    }

    /// The entry this mutation is logged as once assigned a sequence.
    pub fn to_entry(&self, sequence: u64) -> ChangeEntry {
        ChangeEntry {
            sequence,
            operation: self.operation,
            record_id: self.record_id.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
            region_origin: self.region_origin.clone(),
            record_origin: self.record_origin.clone(),
            synced_to: self.synced_to.clone(),
        }
    }
}

/// Filter for reading records out of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    /// Maximum records returned, newest first.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Only records with `last_modified >= since`.
    #[serde(default)]
    pub since: Option<i64>,
    /// Include tombstones (needed when merging across regions).
    #[serde(default)]
    pub include_deleted: bool,
}

fn default_limit() -> usize {
    100
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            since: None,
            include_deleted: false,
        }
    }
}

impl RecordQuery {
    pub fn matches(&self, record: &Record) -> bool {
        (self.include_deleted || !record.deleted)
            && self.since.map_or(true, |since| record.last_modified >= since)
    }
}

/// Order records newest first, `record_id` breaking ties.
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(op: Operation, ts: i64) -> Mutation {
        Mutation {
            operation: op,
            record_id: "post-1".into(),
            payload: json!({"body": "hi"}),
            timestamp: ts,
            region_origin: "eu-west".into(),
            record_origin: "eu-west".into(),
            synced_to: BTreeSet::from(["eu-west".to_string()]),
        }
    }

    #[test]
    fn test_operation_parse_and_display() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
            assert_eq!(op.to_string(), op.as_str());
        }
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_operation_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Operation::Delete).unwrap(), "\"delete\"");
    }

    #[test]
    fn test_mutation_keeps_existing_creator() {
        let existing = Record {
            record_id: "post-1".into(),
            region_origin: "us-east".into(),
            modified_in: "us-east".into(),
            last_modified: 10,
            payload: json!({}),
            deleted: false,
        };
        let record = mutation(Operation::Update, 20).to_record(Some(&existing));
        assert_eq!(record.region_origin, "us-east");
        assert_eq!(record.modified_in, "eu-west");
        assert_eq!(record.last_modified, 20);
    }

    #[test]
    fn test_delete_mutation_is_tombstone() {
        let m = mutation(Operation::Delete, 5);
        assert!(m.version().deleted);
        assert!(m.to_record(None).deleted);
        assert_eq!(m.to_entry(9).sequence, 9);
    }

    #[test]
    fn test_query_matches() {
        let mut record = mutation(Operation::Insert, 50).to_record(None);
        let query = RecordQuery {
            since: Some(40),
            ..Default::default()
        };
        assert!(query.matches(&record));
        record.deleted = true;
        assert!(!query.matches(&record));
        assert!(RecordQuery {
            include_deleted: true,
            ..query.clone()
        }
        .matches(&record));
    }

    #[test]
    fn test_sort_newest_first() {
        let mut records: Vec<Record> = [(1, "b"), (3, "a"), (1, "a")]
            .iter()
            .map(|(ts, id)| {
                let mut r = mutation(Operation::Insert, *ts).to_record(None);
                r.record_id = id.to_string();
                r
            })
            .collect();
        sort_newest_first(&mut records);
        let order: Vec<_> = records.iter().map(|r| (r.last_modified, r.record_id.as_str())).collect();
        assert_eq!(order, vec![(3, "a"), (1, "a"), (1, "b")]);
    }
}
