// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable consumer checkpoints.
//!
//! A checkpoint records, per `(reference, stream)` pair, the offset of the
//! last delivery the consumer committed. On restart the consumer resumes
//! from that offset (inclusive), so up to one commit interval of events is
//! delivered again.
//!
//! ```text
//! deliver 10th message → handle → save(offset)
//!                               (crash here = redeliver from offset, tolerated)
//! ```
//!
//! # Monotonicity
//!
//! Every store ignores a save lower than the stored offset, so a late or
//! duplicated commit can never move a consumer backwards.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (5 attempts,
//! 10ms → 500ms).

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::error::{BoxFuture, RelayError, Result};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Persistent offset storage for stream consumers.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Last committed offset, or `None` if the pair has never committed.
    fn load<'a>(&'a self, reference: &'a str, stream: &'a str) -> BoxFuture<'a, Option<u64>>;

    /// Commit `offset`. Lower offsets than the stored one are ignored.
    fn save<'a>(&'a self, reference: &'a str, stream: &'a str, offset: u64) -> BoxFuture<'a, ()>;
}

/// A stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerCheckpoint {
    pub reference: String,
    pub stream: String,
    pub offset: u64,
    /// Unix millis of the last write.
    pub updated_at: i64,
}

// =============================================================================
// SQLite
// =============================================================================

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
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
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
                crate::metrics::checkpoint_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Checkpoint store backed by a local SQLite file (WAL mode).
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (or create) the store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| RelayError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                reference TEXT NOT NULL,
                stream TEXT NOT NULL,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (reference, stream)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// All stored checkpoints (for diagnostics).
    pub async fn list(&self) -> Result<Vec<ConsumerCheckpoint>> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT reference, stream, position, updated_at FROM checkpoints ORDER BY reference, stream",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(reference, stream, position, updated_at)| ConsumerCheckpoint {
                reference,
                stream,
                offset: position as u64,
                updated_at,
            })
            .collect())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.wal_checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }

    async fn load_offset(&self, reference: &str, stream: &str) -> Result<Option<u64>> {
        let pool = &self.pool;
        let row: Option<(i64,)> = execute_with_retry("checkpoint_load", || async {
            sqlx::query_as("SELECT position FROM checkpoints WHERE reference = ? AND stream = ?")
                .bind(reference)
                .bind(stream)
                .fetch_optional(pool)
                .await
        })
        .await?;

        Ok(row.map(|(position,)| position as u64))
    }

    async fn save_offset(&self, reference: &str, stream: &str, offset: u64) -> Result<()> {
        // SQLite integers are signed 64-bit.
        let position = i64::try_from(offset).map_err(|_| {
            RelayError::CheckpointStorage(format!("offset {offset} exceeds SQLite integer range"))
        })?;
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("checkpoint_save", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (reference, stream, position, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(reference, stream) DO UPDATE SET
                    position = excluded.position,
                    updated_at = excluded.updated_at
                WHERE excluded.position >= checkpoints.position
                "#,
            )
            .bind(reference)
            .bind(stream)
            .bind(position)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                reference = %reference,
                stream = %stream,
                offset,
                "Ignored checkpoint lower than stored offset"
            );
        }
        Ok(())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load<'a>(&'a self, reference: &'a str, stream: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(self.load_offset(reference, stream))
    }

    fn save<'a>(&'a self, reference: &'a str, stream: &'a str, offset: u64) -> BoxFuture<'a, ()> {
        Box::pin(self.save_offset(reference, stream, offset))
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local checkpoint store. Offsets are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    offsets: Mutex<HashMap<(String, String), u64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a pre-seeded checkpoint.
    pub fn with_checkpoint(reference: &str, stream: &str, offset: u64) -> Self {
        let store = Self::new();
        store.put(reference, stream, offset);
        store
    }

    fn put(&self, reference: &str, stream: &str, offset: u64) {
        let mut offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = offsets
            .entry((reference.to_string(), stream.to_string()))
            .or_insert(offset);
        *slot = (*slot).max(offset);
    }

    fn get(&self, reference: &str, stream: &str) -> Option<u64> {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(reference.to_string(), stream.to_string()))
            .copied()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load<'a>(&'a self, reference: &'a str, stream: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move { Ok(self.get(reference, stream)) })
    }

    fn save<'a>(&'a self, reference: &'a str, stream: &'a str, offset: u64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.put(reference, stream, offset);
            Ok(())
        })
    }
}
