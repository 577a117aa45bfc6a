//! Persistence layer for the publish engine
//!
//! Everything the engine persists goes through the repository traits in
//! [`repository`]; business logic never touches SQL directly. Two backends
//! are provided:
//!
//! - SQLite (production): a single database file, shared behind a mutex
//! - In-memory (tests): hash maps with the same semantics
//!
//! The counters the concurrency model cares about - quota usage, circuit
//! state, the round-robin cursor, queue status transitions - are updated with
//! single-row guarded statements so overlapping driver runs cannot lose
//! writes.

pub mod repository;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

pub use repository::{
    AbTestRepository, ChannelRepository, HealthRepository, PoolRepository, QueueRepository,
    QueueStats, QuotaRepository, ScheduleRepository,
};

// ============================================================================
// Errors
// ============================================================================

/// Storage-layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A write would break a data-model invariant; never coerced
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation(reason.into())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// Database
// ============================================================================

/// Shared SQLite handle with schema management
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database, used by tests
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id            TEXT PRIMARY KEY,
                account_id    TEXT NOT NULL,
                display_name  TEXT NOT NULL,
                auth_status   TEXT NOT NULL,
                timezone      TEXT,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pools (
                id                  TEXT PRIMARY KEY,
                name                TEXT NOT NULL,
                strategy            TEXT NOT NULL,
                active              INTEGER NOT NULL DEFAULT 1,
                last_selected_index INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS pool_members (
                pool_id          TEXT NOT NULL REFERENCES pools(id) ON DELETE CASCADE,
                channel_id       TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                priority         INTEGER NOT NULL,
                is_fallback_only INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (pool_id, channel_id),
                UNIQUE (pool_id, priority)
            );

            CREATE TABLE IF NOT EXISTS schedules (
                id                 TEXT PRIMARY KEY,
                source_account_id  TEXT NOT NULL,
                destination_kind   TEXT NOT NULL,
                destination_id     TEXT NOT NULL,
                publish_times      TEXT NOT NULL,
                timezone           TEXT NOT NULL,
                status             TEXT NOT NULL,
                created_at         TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_schedules_channel_dest
                ON schedules(destination_id)
                WHERE destination_kind = 'channel' AND status != 'deleted';

            CREATE TABLE IF NOT EXISTS queue_entries (
                id               TEXT PRIMARY KEY,
                source_item_id   TEXT NOT NULL,
                schedule_id      TEXT NOT NULL,
                channel_id       TEXT NOT NULL,
                scheduled_at     TEXT NOT NULL,
                status           TEXT NOT NULL,
                phase            TEXT,
                progress_percent INTEGER NOT NULL DEFAULT 0,
                attempts         INTEGER NOT NULL DEFAULT 0,
                next_attempt_at  TEXT,
                last_error       TEXT,
                error_phase      TEXT,
                destination_url  TEXT,
                experiment_arm   TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_pending_item
                ON queue_entries(source_item_id)
                WHERE status IN ('queued', 'processing');

            CREATE INDEX IF NOT EXISTS idx_queue_due
                ON queue_entries(status, scheduled_at);

            CREATE TABLE IF NOT EXISTS quota_usage (
                channel_id TEXT NOT NULL,
                date       TEXT NOT NULL,
                used       INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (channel_id, date)
            );

            CREATE TABLE IF NOT EXISTS health_records (
                channel_id           TEXT PRIMARY KEY,
                successes            INTEGER NOT NULL DEFAULT 0,
                failures             INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                circuit_state        TEXT NOT NULL,
                probe_in_flight      INTEGER NOT NULL DEFAULT 0,
                last_failure_at      TEXT,
                last_error           TEXT,
                last_error_phase     TEXT,
                last_checked_at      TEXT,
                updated_at           TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ab_tests (
                id                  TEXT PRIMARY KEY,
                schedule_id         TEXT NOT NULL UNIQUE,
                status              TEXT NOT NULL,
                variant_a_name      TEXT NOT NULL,
                variant_a_slots     TEXT NOT NULL,
                variant_a_uploads   INTEGER NOT NULL DEFAULT 0,
                variant_a_successes INTEGER NOT NULL DEFAULT 0,
                variant_b_name      TEXT NOT NULL,
                variant_b_slots     TEXT NOT NULL,
                variant_b_uploads   INTEGER NOT NULL DEFAULT 0,
                variant_b_successes INTEGER NOT NULL DEFAULT 0,
                winner              TEXT,
                created_at          TEXT NOT NULL,
                completed_at        TEXT
            );
            "#,
        )?;
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

/// Bundle of every repository the engine needs
///
/// Construct with [`Store::sqlite`] for production or [`Store::memory`] for
/// tests. Cross-repository operations (cascading deletes) live here so both
/// backends share the behavior.
#[derive(Clone)]
pub struct Store {
    pub channels: Arc<dyn ChannelRepository>,
    pub pools: Arc<dyn PoolRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub quota: Arc<dyn QuotaRepository>,
    pub health: Arc<dyn HealthRepository>,
    pub ab_tests: Arc<dyn AbTestRepository>,
}

impl Store {
    /// SQLite-backed store at the given path
    pub fn sqlite(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Arc::new(Database::open(path)?);
        Ok(Self::from_database(db))
    }

    /// SQLite-backed store on an in-memory database
    pub fn sqlite_in_memory() -> StorageResult<Self> {
        let db = Arc::new(Database::open_in_memory()?);
        Ok(Self::from_database(db))
    }

    fn from_database(db: Arc<Database>) -> Self {
        Self {
            channels: Arc::new(repository::SqliteChannelRepository::new(db.clone())),
            pools: Arc::new(repository::SqlitePoolRepository::new(db.clone())),
            schedules: Arc::new(repository::SqliteScheduleRepository::new(db.clone())),
            queue: Arc::new(repository::SqliteQueueRepository::new(db.clone())),
            quota: Arc::new(repository::SqliteQuotaRepository::new(db.clone())),
            health: Arc::new(repository::SqliteHealthRepository::new(db.clone())),
            ab_tests: Arc::new(repository::SqliteAbTestRepository::new(db)),
        }
    }

    /// Purely in-memory store with no SQLite behind it
    pub fn memory() -> Self {
        Self {
            channels: Arc::new(repository::MemoryChannelRepository::new()),
            pools: Arc::new(repository::MemoryPoolRepository::new()),
            schedules: Arc::new(repository::MemoryScheduleRepository::new()),
            queue: Arc::new(repository::MemoryQueueRepository::new()),
            quota: Arc::new(repository::MemoryQuotaRepository::new()),
            health: Arc::new(repository::MemoryHealthRepository::new()),
            ab_tests: Arc::new(repository::MemoryAbTestRepository::new()),
        }
    }

    /// Delete a channel, cascading its pool memberships
    pub fn delete_channel(&self, channel_id: Uuid) -> StorageResult<()> {
        self.pools.remove_member_from_all(channel_id)?;
        self.channels.delete(channel_id)
    }
}
