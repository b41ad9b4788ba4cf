// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable record store and change log backed by SQLite.
//!
//! Holds both the region's records and its append-only change log in one
//! database so "write record + append entry" is a single SQLite
//! transaction. Peer state is never persisted: after a restart, outbound
//! replication resumes from the `synced_to` sets stored here.
//!
//! # Schema
//!
//! ```text
//! records             record_id PK, region_origin, modified_in, last_modified, payload, deleted
//! change_log          sequence PK AUTOINCREMENT, operation, record_id, payload, timestamp,
//!                     region_origin, record_origin, created_at
//! change_log_synced   (sequence, region)  -- synced_to membership
//! change_log_pending  (region, sequence)  -- synced_to NON-membership, per configured peer
//! ```
//!
//! `change_log_pending` is what makes `unsent_for` an index range scan
//! instead of an anti-join over the whole log. Rows are added at append
//! time for every configured peer not already in `synced_to`, removed by
//! `mark_synced`, and backfilled on open for peers added to the config
//! since the entries were written.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff (max 5 attempts).
//! Within the process writes are additionally serialized by a mutex, so
//! the resolve-then-write step of `append` never races another append.

use crate::config::ChangeLogConfig;
use crate::error::{ReplicationError, Result, StoreError};
use crate::record::{ChangeEntry, Mutation, Operation, Record, RecordQuery, Version};
use crate::resolver::{resolve, Resolution};
use crate::store::{AppendOutcome, BoxFuture, RegionStore, StoreResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Separator used when folding `synced_to` into one column.
const SYNCED_SEPARATOR: char = '\u{1f}';

const ENTRY_COLUMNS: &str = r#"
    c.sequence, c.operation, c.record_id, c.payload, c.timestamp,
    c.region_origin, c.record_origin,
    (SELECT group_concat(s.region, char(31)) FROM change_log_synced s WHERE s.sequence = c.sequence)
"#;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        record_id TEXT PRIMARY KEY,
        region_origin TEXT NOT NULL,
        modified_in TEXT NOT NULL,
        last_modified INTEGER NOT NULL,
        payload TEXT NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_records_last_modified ON records (last_modified)",
    r#"
    CREATE TABLE IF NOT EXISTS change_log (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        operation TEXT NOT NULL,
        record_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        region_origin TEXT NOT NULL,
        record_origin TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_change_log_timestamp ON change_log (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS change_log_synced (
        sequence INTEGER NOT NULL,
        region TEXT NOT NULL,
        PRIMARY KEY (sequence, region)
    ) WITHOUT ROWID
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS change_log_pending (
        region TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        PRIMARY KEY (region, sequence)
    ) WITHOUT ROWID
    "#,
];

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

type EntryRow = (i64, String, String, String, i64, String, String, Option<String>);
type RecordRow = (String, String, String, i64, String, bool);

fn entry_from_row(row: EntryRow) -> StoreResult<ChangeEntry> {
    let (sequence, operation, record_id, payload, timestamp, region_origin, record_origin, synced) = row;
    let operation = Operation::from_str(&operation).map_err(StoreError::Corrupt)?;
    let synced_to: BTreeSet<String> = synced
        .map(|s| s.split(SYNCED_SEPARATOR).map(str::to_string).collect())
        .unwrap_or_default();

    Ok(ChangeEntry {
        sequence: sequence as u64,
        operation,
        record_id,
        payload: serde_json::from_str(&payload)?,
        timestamp,
        region_origin,
        record_origin,
        synced_to,
    })
}

fn record_from_row(row: RecordRow) -> StoreResult<Record> {
    let (record_id, region_origin, modified_in, last_modified, payload, deleted) = row;
    Ok(Record {
        record_id,
        region_origin,
        modified_in,
        last_modified,
        payload: serde_json::from_str(&payload)?,
        deleted,
    })
}

/// SQLite-backed [`RegionStore`].
pub struct SqliteStore {
    pool: SqlitePool,
    /// Peers that get `change_log_pending` rows.
    peers: Vec<String>,
    /// Serializes writers (resolve + write must not interleave).
    write_lock: Mutex<()>,
    path: String,
}

impl SqliteStore {
    /// Open (creating if needed) the store at `config.sqlite_path`.
    pub async fn open(config: &ChangeLogConfig, peers: &[String]) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, peers = peers.len(), "Opening change log");

        let (options, pool_options) = if config.is_in_memory() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // One connection that never recycles, or the database vanishes
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true);
            (options, SqlitePoolOptions::new().max_connections(4))
        };

        let pool = pool_options.connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(*statement).execute(&pool).await?;
        }

        let store = Self {
            pool,
            peers: peers.to_vec(),
            write_lock: Mutex::new(()),
            path,
        };
        store.backfill_pending().await?;
        Ok(store)
    }

    /// Index entries not yet sent to peers that were added since the
    /// entries were written.
    async fn backfill_pending(&self) -> Result<()> {
        let pool = &self.pool;
        for peer in &self.peers {
            let added = execute_with_retry("backfill_pending", || async move {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO change_log_pending (region, sequence)
                    SELECT ?1, c.sequence FROM change_log c
                    WHERE NOT EXISTS (
                        SELECT 1 FROM change_log_synced s
                        WHERE s.sequence = c.sequence AND s.region = ?1
                    )
                    "#,
                )
                .bind(peer)
                .execute(pool)
                .await
            })
            .await?
            .rows_affected();

            if added > 0 {
                info!(peer_id = %peer, added, "Backfilled unsent entries for peer");
            }
        }
        Ok(())
    }

    /// One attempt at the append transaction. `None` means superseded.
    async fn append_once(
        pool: &SqlitePool,
        peers: &[String],
        mutation: &Mutation,
        payload: &str,
    ) -> std::result::Result<Option<u64>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let current: Option<(i64, String, bool)> = sqlx::query_as(
            "SELECT last_modified, modified_in, deleted FROM records WHERE record_id = ?",
        )
        .bind(&mutation.record_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((last_modified, modified_in, deleted)) = current {
            let stored = Version::new(last_modified, modified_in, deleted);
            if resolve(&stored, &mutation.version()) == Resolution::KeepLocal {
                // Dropping the transaction rolls it back
                return Ok(None);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO records (record_id, region_origin, modified_in, last_modified, payload, deleted)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(record_id) DO UPDATE SET
                modified_in = excluded.modified_in,
                last_modified = excluded.last_modified,
                payload = excluded.payload,
                deleted = excluded.deleted
            "#,
        )
        .bind(&mutation.record_id)
        .bind(&mutation.record_origin)
        .bind(&mutation.region_origin)
        .bind(mutation.timestamp)
        .bind(payload)
        .bind(mutation.operation.is_delete())
        .execute(&mut *tx)
        .await?;

        let sequence = sqlx::query(
            r#"
            INSERT INTO change_log (operation, record_id, payload, timestamp, region_origin, record_origin, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mutation.operation.as_str())
        .bind(&mutation.record_id)
        .bind(payload)
        .bind(mutation.timestamp)
        .bind(&mutation.region_origin)
        .bind(&mutation.record_origin)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for region in &mutation.synced_to {
            sqlx::query("INSERT OR IGNORE INTO change_log_synced (sequence, region) VALUES (?, ?)")
                .bind(sequence)
                .bind(region)
                .execute(&mut *tx)
                .await?;
        }

        for peer in peers.iter().filter(|p| !mutation.synced_to.contains(*p)) {
            sqlx::query("INSERT OR IGNORE INTO change_log_pending (region, sequence) VALUES (?, ?)")
                .bind(peer)
                .bind(sequence)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(Some(sequence as u64))
    }

    async fn fetch_entries(&self, sql: &str, binds: EntryBinds<'_>) -> StoreResult<Vec<ChangeEntry>> {
        let query = sqlx::query_as::<_, EntryRow>(sql);
        let query = match binds {
            EntryBinds::Pending { peer, limit } => query.bind(peer).bind(limit),
            EntryBinds::Range { from, to } => query.bind(from).bind(to),
            EntryBinds::Between { since, until, limit } => query.bind(since).bind(until).bind(limit),
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Change log closed");
    }
}

/// SQLite binds integers as i64; clamp oversized limits.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

enum EntryBinds<'a> {
    Pending { peer: &'a str, limit: i64 },
    Range { from: i64, to: i64 },
    Between { since: i64, until: i64, limit: i64 },
}

impl RegionStore for SqliteStore {
    fn get(&self, record_id: &str) -> BoxFuture<'_, Option<Record>> {
        let record_id = record_id.to_string();
        Box::pin(async move {
            let row: Option<RecordRow> = sqlx::query_as(
                r#"
                SELECT record_id, region_origin, modified_in, last_modified, payload, deleted
                FROM records WHERE record_id = ?
                "#,
            )
            .bind(&record_id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(record_from_row).transpose()
        })
    }

    fn append(&self, mutation: Mutation) -> BoxFuture<'_, AppendOutcome> {
        Box::pin(async move {
            let payload = serde_json::to_string(&mutation.payload)?;
            let _guard = self.write_lock.lock().await;

            let pool = &self.pool;
            let peers = self.peers.as_slice();
            let mutation_ref = &mutation;
            let payload_ref = payload.as_str();
            let applied = execute_with_retry("append", || async move {
                Self::append_once(pool, peers, mutation_ref, payload_ref).await
            })
            .await?;

            match applied {
                Some(sequence) => {
                    debug!(
                        sequence,
                        record_id = %mutation.record_id,
                        operation = %mutation.operation,
                        origin = %mutation.region_origin,
                        "Appended change log entry"
                    );
                    Ok(AppendOutcome::Applied { sequence })
                }
                None => {
                    let current = self.get(&mutation.record_id).await?.ok_or_else(|| {
                        StoreError::Corrupt(format!("record {} vanished during append", mutation.record_id))
                    })?;
                    Ok(AppendOutcome::Superseded { current })
                }
            }
        })
    }

    fn unsent_for(&self, peer: &str, limit: usize) -> BoxFuture<'_, Vec<ChangeEntry>> {
        let peer = peer.to_string();
        Box::pin(async move {
            let limit = sql_limit(limit);
            if self.peers.iter().any(|p| *p == peer) {
                let sql = format!(
                    r#"
                    SELECT {} FROM change_log_pending p
                    JOIN change_log c ON c.sequence = p.sequence
                    WHERE p.region = ?
                    ORDER BY p.sequence ASC
                    LIMIT ?
                    "#,
                    ENTRY_COLUMNS
                );
                self.fetch_entries(&sql, EntryBinds::Pending { peer: &peer, limit }).await
            } else {
                // Unconfigured peer: no pending index, fall back to anti-join
                let sql = format!(
                    r#"
                    SELECT {} FROM change_log c
                    WHERE NOT EXISTS (
                        SELECT 1 FROM change_log_synced s
                        WHERE s.sequence = c.sequence AND s.region = ?
                    )
                    ORDER BY c.sequence ASC
                    LIMIT ?
                    "#,
                    ENTRY_COLUMNS
                );
                self.fetch_entries(&sql, EntryBinds::Pending { peer: &peer, limit }).await
            }
        })
    }

    fn mark_synced(&self, sequences: &[u64], peer: &str) -> BoxFuture<'_, usize> {
        let sequences: Vec<i64> = sequences.iter().map(|s| *s as i64).collect();
        let peer = peer.to_string();
        Box::pin(async move {
            if sequences.is_empty() {
                return Ok(0);
            }
            let _guard = self.write_lock.lock().await;

            let pool = &self.pool;
            let sequences_ref = sequences.as_slice();
            let peer_ref = peer.as_str();
            let marked = execute_with_retry("mark_synced", || async move {
                let mut tx = pool.begin().await?;
                let mut marked = 0u64;
                for seq in sequences_ref {
                    marked += sqlx::query(
                        r#"
                        INSERT OR IGNORE INTO change_log_synced (sequence, region)
                        SELECT sequence, ? FROM change_log WHERE sequence = ?
                        "#,
                    )
                    .bind(peer_ref)
                    .bind(*seq)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                    sqlx::query("DELETE FROM change_log_pending WHERE region = ? AND sequence = ?")
                        .bind(peer_ref)
                        .bind(*seq)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(marked)
            })
            .await?;

            Ok(marked as usize)
        })
    }

    fn entries_in_range(&self, from: u64, to: u64) -> BoxFuture<'_, Vec<ChangeEntry>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {} FROM change_log c WHERE c.sequence BETWEEN ? AND ? ORDER BY c.sequence ASC",
                ENTRY_COLUMNS
            );
            self.fetch_entries(&sql, EntryBinds::Range { from: from as i64, to: to as i64 })
                .await
        })
    }

    fn entries_between(
        &self,
        since: i64,
        until: Option<i64>,
        limit: usize,
    ) -> BoxFuture<'_, Vec<ChangeEntry>> {
        Box::pin(async move {
            let sql = format!(
                r#"
                SELECT {} FROM change_log c
                WHERE c.timestamp >= ? AND c.timestamp <= ?
                ORDER BY c.timestamp ASC, c.sequence ASC
                LIMIT ?
                "#,
                ENTRY_COLUMNS
            );
            self.fetch_entries(
                &sql,
                EntryBinds::Between {
                    since,
                    until: until.unwrap_or(i64::MAX),
                    limit: sql_limit(limit),
                },
            )
            .await
        })
    }

    fn query(&self, query: &RecordQuery) -> BoxFuture<'_, Vec<Record>> {
        let query = query.clone();
        Box::pin(async move {
            let rows: Vec<RecordRow> = sqlx::query_as(
                r#"
                SELECT record_id, region_origin, modified_in, last_modified, payload, deleted
                FROM records
                WHERE (? OR deleted = 0) AND last_modified >= ?
                ORDER BY last_modified DESC, record_id ASC
                LIMIT ?
                "#,
            )
            .bind(query.include_deleted)
            .bind(query.since.unwrap_or(i64::MIN))
            .bind(sql_limit(query.limit))
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(record_from_row).collect()
        })
    }

    fn head_sequence(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let head: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence) FROM change_log")
                .fetch_one(&self.pool)
                .await?;
            Ok(head.unwrap_or(0) as u64)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            SqliteStore::close(self).await;
            Ok(())
        })
    }
}
