//! Repository traits and their SQLite / in-memory implementations
//!
//! Business logic depends only on the traits; the SQLite implementations
//! carry the guarded single-row updates the concurrency model relies on, and
//! the in-memory implementations mirror the same semantics for tests.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{Database, StorageError, StorageResult};
use crate::abtest::{AbTest, TestStatus, Variant};
use crate::health::{CircuitState, HealthRecord};
use crate::models::{
    AuthStatus, Channel, Destination, ExperimentArm, Pool, PoolMember, ProgressPhase, QueueEntry,
    QueueStatus, Schedule, ScheduleStatus,
};
use crate::timing::OutcomeSample;

// ============================================================================
// Row Conversion Helpers
// ============================================================================

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRow(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(s: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StorageError::CorruptRow(format!("bad uuid '{s}': {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> StorageResult<T> {
    s.parse().map_err(StorageError::CorruptRow)
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> StorageResult<T> {
    serde_json::from_str(s).map_err(|e| StorageError::CorruptRow(format!("bad json: {e}")))
}

// ============================================================================
// Channel Repository
// ============================================================================

/// Persistence for destination channels
pub trait ChannelRepository: Send + Sync {
    fn insert(&self, channel: &Channel) -> StorageResult<()>;
    fn get(&self, id: Uuid) -> StorageResult<Option<Channel>>;
    fn list(&self) -> StorageResult<Vec<Channel>>;
    fn set_auth_status(&self, id: Uuid, status: AuthStatus) -> StorageResult<()>;
    fn delete(&self, id: Uuid) -> StorageResult<()>;
}

pub struct SqliteChannelRepository {
    db: Arc<Database>,
}

impl SqliteChannelRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawChannel> {
        Ok(RawChannel {
            id: row.get(0)?,
            account_id: row.get(1)?,
            display_name: row.get(2)?,
            auth_status: row.get(3)?,
            timezone: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

struct RawChannel {
    id: String,
    account_id: String,
    display_name: String,
    auth_status: String,
    timezone: Option<String>,
    created_at: String,
}

impl RawChannel {
    fn into_channel(self) -> StorageResult<Channel> {
        Ok(Channel {
            id: parse_uuid(&self.id)?,
            account_id: parse_uuid(&self.account_id)?,
            display_name: self.display_name,
            auth_status: parse_enum(&self.auth_status)?,
            timezone: self
                .timezone
                .as_deref()
                .map(|tz| {
                    tz.parse::<Tz>()
                        .map_err(|e| StorageError::CorruptRow(format!("bad timezone: {e}")))
                })
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl ChannelRepository for SqliteChannelRepository {
    fn insert(&self, channel: &Channel) -> StorageResult<()> {
        self.db.lock().execute(
            "INSERT INTO channels (id, account_id, display_name, auth_status, timezone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                channel.id.to_string(),
                channel.account_id.to_string(),
                channel.display_name,
                channel.auth_status.as_str(),
                channel.timezone.map(|tz| tz.name().to_string()),
                ts(channel.created_at),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<Channel>> {
        let raw = self
            .db
            .lock()
            .query_row(
                "SELECT id, account_id, display_name, auth_status, timezone, created_at
                 FROM channels WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_channel,
            )
            .optional()?;
        raw.map(RawChannel::into_channel).transpose()
    }

    fn list(&self) -> StorageResult<Vec<Channel>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, display_name, auth_status, timezone, created_at
             FROM channels ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], Self::row_to_channel)?;
        let mut channels = Vec::new();
        for raw in rows {
            channels.push(raw?.into_channel()?);
        }
        Ok(channels)
    }

    fn set_auth_status(&self, id: Uuid, status: AuthStatus) -> StorageResult<()> {
        let changed = self.db.lock().execute(
            "UPDATE channels SET auth_status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("channel", id));
        }
        Ok(())
    }

    fn delete(&self, id: Uuid) -> StorageResult<()> {
        self.db
            .lock()
            .execute("DELETE FROM channels WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }
}

/// In-memory channel repository
#[derive(Default)]
pub struct MemoryChannelRepository {
    channels: Mutex<HashMap<Uuid, Channel>>,
}

impl MemoryChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelRepository for MemoryChannelRepository {
    fn insert(&self, channel: &Channel) -> StorageResult<()> {
        self.channels
            .lock()
            .unwrap()
            .insert(channel.id, channel.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<Channel>> {
        Ok(self.channels.lock().unwrap().get(&id).cloned())
    }

    fn list(&self) -> StorageResult<Vec<Channel>> {
        let mut channels: Vec<Channel> = self.channels.lock().unwrap().values().cloned().collect();
        channels.sort_by_key(|c| c.created_at);
        Ok(channels)
    }

    fn set_auth_status(&self, id: Uuid, status: AuthStatus) -> StorageResult<()> {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("channel", id))?;
        channel.auth_status = status;
        Ok(())
    }

    fn delete(&self, id: Uuid) -> StorageResult<()> {
        self.channels.lock().unwrap().remove(&id);
        Ok(())
    }
}

// ============================================================================
// Pool Repository
// ============================================================================

/// Persistence for rotation pools and their membership
pub trait PoolRepository: Send + Sync {
    /// Insert a pool with its members; priority collisions are rejected
    fn insert(&self, pool: &Pool) -> StorageResult<()>;
    fn get(&self, id: Uuid) -> StorageResult<Option<Pool>>;
    fn add_member(&self, pool_id: Uuid, member: &PoolMember) -> StorageResult<()>;
    fn remove_member(&self, pool_id: Uuid, channel_id: Uuid) -> StorageResult<()>;
    /// Drop a channel from every pool it belongs to (channel deletion cascade)
    fn remove_member_from_all(&self, channel_id: Uuid) -> StorageResult<()>;
    /// Guarded cursor update; `false` means another writer moved it first
    fn update_cursor(&self, pool_id: Uuid, expected: u32, new: u32) -> StorageResult<bool>;
    fn set_active(&self, pool_id: Uuid, active: bool) -> StorageResult<()>;
}

pub struct SqlitePoolRepository {
    db: Arc<Database>,
}

impl SqlitePoolRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl PoolRepository for SqlitePoolRepository {
    fn insert(&self, pool: &Pool) -> StorageResult<()> {
        let mut seen = std::collections::HashSet::new();
        for member in &pool.members {
            if !seen.insert(member.priority) {
                return Err(StorageError::invariant(format!(
                    "priority {} duplicated in pool '{}'",
                    member.priority, pool.name
                )));
            }
        }

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO pools (id, name, strategy, active, last_selected_index)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pool.id.to_string(),
                pool.name,
                pool.strategy.as_str(),
                pool.active as i64,
                pool.last_selected_index as i64,
            ],
        )?;
        for member in &pool.members {
            conn.execute(
                "INSERT INTO pool_members (pool_id, channel_id, priority, is_fallback_only)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    pool.id.to_string(),
                    member.channel_id.to_string(),
                    member.priority as i64,
                    member.is_fallback_only as i64,
                ],
            )?;
        }
        Ok(())
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<Pool>> {
        let conn = self.db.lock();
        let header = conn
            .query_row(
                "SELECT id, name, strategy, active, last_selected_index FROM pools WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((raw_id, name, strategy, active, cursor)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT channel_id, priority, is_fallback_only
             FROM pool_members WHERE pool_id = ?1 ORDER BY priority",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut members = Vec::new();
        for row in rows {
            let (channel_id, priority, fallback) = row?;
            members.push(PoolMember {
                channel_id: parse_uuid(&channel_id)?,
                priority: priority as u32,
                is_fallback_only: fallback != 0,
            });
        }

        Ok(Some(Pool {
            id: parse_uuid(&raw_id)?,
            name,
            strategy: parse_enum(&strategy)?,
            active: active != 0,
            last_selected_index: cursor as u32,
            members,
        }))
    }

    fn add_member(&self, pool_id: Uuid, member: &PoolMember) -> StorageResult<()> {
        let result = self.db.lock().execute(
            "INSERT INTO pool_members (pool_id, channel_id, priority, is_fallback_only)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                pool_id.to_string(),
                member.channel_id.to_string(),
                member.priority as i64,
                member.is_fallback_only as i64,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::invariant(format!(
                    "priority {} already assigned in pool {}",
                    member.priority, pool_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove_member(&self, pool_id: Uuid, channel_id: Uuid) -> StorageResult<()> {
        self.db.lock().execute(
            "DELETE FROM pool_members WHERE pool_id = ?1 AND channel_id = ?2",
            params![pool_id.to_string(), channel_id.to_string()],
        )?;
        Ok(())
    }

    fn remove_member_from_all(&self, channel_id: Uuid) -> StorageResult<()> {
        self.db.lock().execute(
            "DELETE FROM pool_members WHERE channel_id = ?1",
            params![channel_id.to_string()],
        )?;
        Ok(())
    }

    fn update_cursor(&self, pool_id: Uuid, expected: u32, new: u32) -> StorageResult<bool> {
        let changed = self.db.lock().execute(
            "UPDATE pools SET last_selected_index = ?1
             WHERE id = ?2 AND last_selected_index = ?3",
            params![new as i64, pool_id.to_string(), expected as i64],
        )?;
        Ok(changed == 1)
    }

    fn set_active(&self, pool_id: Uuid, active: bool) -> StorageResult<()> {
        let changed = self.db.lock().execute(
            "UPDATE pools SET active = ?1 WHERE id = ?2",
            params![active as i64, pool_id.to_string()],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("pool", pool_id));
        }
        Ok(())
    }
}

/// In-memory pool repository
#[derive(Default)]
pub struct MemoryPoolRepository {
    pools: Mutex<HashMap<Uuid, Pool>>,
}

impl MemoryPoolRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolRepository for MemoryPoolRepository {
    fn insert(&self, pool: &Pool) -> StorageResult<()> {
        let mut seen = std::collections::HashSet::new();
        for member in &pool.members {
            if !seen.insert(member.priority) {
                return Err(StorageError::invariant(format!(
                    "priority {} duplicated in pool '{}'",
                    member.priority, pool.name
                )));
            }
        }
        self.pools.lock().unwrap().insert(pool.id, pool.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<Pool>> {
        Ok(self.pools.lock().unwrap().get(&id).cloned())
    }

    fn add_member(&self, pool_id: Uuid, member: &PoolMember) -> StorageResult<()> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get_mut(&pool_id)
            .ok_or_else(|| StorageError::not_found("pool", pool_id))?;
        pool.add_member(member.clone())
            .map_err(StorageError::invariant)
    }

    fn remove_member(&self, pool_id: Uuid, channel_id: Uuid) -> StorageResult<()> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get_mut(&pool_id) {
            pool.remove_member(channel_id);
        }
        Ok(())
    }

    fn remove_member_from_all(&self, channel_id: Uuid) -> StorageResult<()> {
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.values_mut() {
            pool.remove_member(channel_id);
        }
        Ok(())
    }

    fn update_cursor(&self, pool_id: Uuid, expected: u32, new: u32) -> StorageResult<bool> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get_mut(&pool_id)
            .ok_or_else(|| StorageError::not_found("pool", pool_id))?;
        if pool.last_selected_index != expected {
            return Ok(false);
        }
        pool.last_selected_index = new;
        Ok(true)
    }

    fn set_active(&self, pool_id: Uuid, active: bool) -> StorageResult<()> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get_mut(&pool_id)
            .ok_or_else(|| StorageError::not_found("pool", pool_id))?;
        pool.active = active;
        Ok(())
    }
}

// ============================================================================
// Schedule Repository
// ============================================================================

/// Persistence for schedules
pub trait ScheduleRepository: Send + Sync {
    /// Insert a schedule; a second schedule on the same destination channel
    /// is rejected
    fn insert(&self, schedule: &Schedule) -> StorageResult<()>;
    fn get(&self, id: Uuid) -> StorageResult<Option<Schedule>>;
    fn list_active(&self) -> StorageResult<Vec<Schedule>>;
    fn list_for_source_account(&self, source_account_id: Uuid) -> StorageResult<Vec<Schedule>>;
    fn set_status(&self, id: Uuid, status: ScheduleStatus) -> StorageResult<()>;
}

pub struct SqliteScheduleRepository {
    db: Arc<Database>,
}

impl SqliteScheduleRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSchedule> {
        Ok(RawSchedule {
            id: row.get(0)?,
            source_account_id: row.get(1)?,
            destination_kind: row.get(2)?,
            destination_id: row.get(3)?,
            publish_times: row.get(4)?,
            timezone: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

struct RawSchedule {
    id: String,
    source_account_id: String,
    destination_kind: String,
    destination_id: String,
    publish_times: String,
    timezone: String,
    status: String,
    created_at: String,
}

impl RawSchedule {
    fn into_schedule(self) -> StorageResult<Schedule> {
        let destination_id = parse_uuid(&self.destination_id)?;
        let destination = match self.destination_kind.as_str() {
            "channel" => Destination::Channel(destination_id),
            "pool" => Destination::Pool(destination_id),
            other => {
                return Err(StorageError::CorruptRow(format!(
                    "bad destination kind '{other}'"
                )))
            }
        };
        Ok(Schedule {
            id: parse_uuid(&self.id)?,
            source_account_id: parse_uuid(&self.source_account_id)?,
            destination,
            publish_times: parse_json(&self.publish_times)?,
            timezone: self
                .timezone
                .parse::<Tz>()
                .map_err(|e| StorageError::CorruptRow(format!("bad timezone: {e}")))?,
            status: parse_enum(&self.status)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn destination_parts(destination: Destination) -> (&'static str, Uuid) {
    match destination {
        Destination::Channel(id) => ("channel", id),
        Destination::Pool(id) => ("pool", id),
    }
}

impl ScheduleRepository for SqliteScheduleRepository {
    fn insert(&self, schedule: &Schedule) -> StorageResult<()> {
        let (kind, dest_id) = destination_parts(schedule.destination);

        let result = self.db.lock().execute(
            "INSERT INTO schedules
             (id, source_account_id, destination_kind, destination_id,
              publish_times, timezone, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                schedule.id.to_string(),
                schedule.source_account_id.to_string(),
                kind,
                dest_id.to_string(),
                serde_json::to_string(&schedule.publish_times)
                    .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
                schedule.timezone.name(),
                schedule.status.as_str(),
                ts(schedule.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::invariant(format!(
                    "channel {dest_id} already has a schedule"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<Schedule>> {
        let raw = self
            .db
            .lock()
            .query_row(
                "SELECT id, source_account_id, destination_kind, destination_id,
                        publish_times, timezone, status, created_at
                 FROM schedules WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_schedule,
            )
            .optional()?;
        raw.map(RawSchedule::into_schedule).transpose()
    }

    fn list_active(&self) -> StorageResult<Vec<Schedule>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_account_id, destination_kind, destination_id,
                    publish_times, timezone, status, created_at
             FROM schedules WHERE status = 'active' ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], Self::row_to_schedule)?;
        let mut schedules = Vec::new();
        for raw in rows {
            schedules.push(raw?.into_schedule()?);
        }
        Ok(schedules)
    }

    fn list_for_source_account(&self, source_account_id: Uuid) -> StorageResult<Vec<Schedule>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_account_id, destination_kind, destination_id,
                    publish_times, timezone, status, created_at
             FROM schedules WHERE source_account_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![source_account_id.to_string()], Self::row_to_schedule)?;
        let mut schedules = Vec::new();
        for raw in rows {
            schedules.push(raw?.into_schedule()?);
        }
        Ok(schedules)
    }

    fn set_status(&self, id: Uuid, status: ScheduleStatus) -> StorageResult<()> {
        let changed = self.db.lock().execute(
            "UPDATE schedules SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("schedule", id));
        }
        Ok(())
    }
}

/// In-memory schedule repository
#[derive(Default)]
pub struct MemoryScheduleRepository {
    schedules: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleRepository for MemoryScheduleRepository {
    fn insert(&self, schedule: &Schedule) -> StorageResult<()> {
        let mut schedules = self.schedules.lock().unwrap();
        if let Destination::Channel(channel_id) = schedule.destination {
            let taken = schedules.values().any(|s| {
                s.destination == Destination::Channel(channel_id)
                    && s.status != ScheduleStatus::Deleted
            });
            if taken {
                return Err(StorageError::invariant(format!(
                    "channel {channel_id} already has a schedule"
                )));
            }
        }
        schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<Schedule>> {
        Ok(self.schedules.lock().unwrap().get(&id).cloned())
    }

    fn list_active(&self) -> StorageResult<Vec<Schedule>> {
        let mut active: Vec<Schedule> = self
            .schedules
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }

    fn list_for_source_account(&self, source_account_id: Uuid) -> StorageResult<Vec<Schedule>> {
        let mut matches: Vec<Schedule> = self
            .schedules
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.source_account_id == source_account_id)
            .cloned()
            .collect();
        matches.sort_by_key(|s| s.created_at);
        Ok(matches)
    }

    fn set_status(&self, id: Uuid, status: ScheduleStatus) -> StorageResult<()> {
        let mut schedules = self.schedules.lock().unwrap();
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("schedule", id))?;
        schedule.status = status;
        Ok(())
    }
}

// ============================================================================
// Queue Repository
// ============================================================================

/// Aggregate queue counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub published: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.published + self.failed
    }

    pub fn pending(&self) -> usize {
        self.queued + self.processing
    }
}

/// Persistence for the publish queue
///
/// Status transitions are guarded: each transition method returns whether the
/// row actually moved, which is what makes reprocessing idempotent.
pub trait QueueRepository: Send + Sync {
    /// Insert an entry; a second non-terminal entry for the same source item
    /// is rejected
    fn enqueue(&self, entry: &QueueEntry) -> StorageResult<()>;
    fn get(&self, id: Uuid) -> StorageResult<Option<QueueEntry>>;
    fn entry_for_slot(
        &self,
        schedule_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> StorageResult<Option<QueueEntry>>;
    fn has_pending_for_item(&self, source_item_id: &str) -> StorageResult<bool>;
    /// Whether any entry (terminal or not) exists for the source item
    fn has_any_for_item(&self, source_item_id: &str) -> StorageResult<bool>;
    /// Due entries in scheduled-time order, at most `limit`
    fn due_batch(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<QueueEntry>>;
    /// `queued` → `processing`; `false` when another worker claimed it first
    fn claim(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool>;
    fn set_progress(&self, id: Uuid, phase: ProgressPhase, percent: u8) -> StorageResult<()>;
    /// `processing` → `published`; `false` when the entry was not processing
    fn complete_success(&self, id: Uuid, url: &str, now: DateTime<Utc>) -> StorageResult<bool>;
    /// `processing` → `queued` with backoff metadata
    fn reschedule_retry(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;
    /// `processing` → terminal `failed`
    fn complete_failure(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;
    /// Manual retry edge: `failed` → `queued` with backoff cleared
    fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool>;
    /// Remove all `queued` (never `processing`) entries for the given
    /// schedules; returns how many were cancelled
    fn cancel_queued(&self, schedule_ids: &[Uuid]) -> StorageResult<usize>;
    /// `processing` entries whose last update predates `cutoff`
    fn stale_processing(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<QueueEntry>>;
    /// Terminal outcomes for a channel, feeding the time scorer
    fn outcome_samples(&self, channel_id: Uuid) -> StorageResult<Vec<OutcomeSample>>;
    fn stats(&self) -> StorageResult<QueueStats>;
}

pub struct SqliteQueueRepository {
    db: Arc<Database>,
}

const ENTRY_COLUMNS: &str = "id, source_item_id, schedule_id, channel_id, scheduled_at, status, \
                             phase, progress_percent, attempts, next_attempt_at, last_error, \
                             error_phase, destination_url, experiment_arm, created_at, updated_at";

impl SqliteQueueRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            id: row.get(0)?,
            source_item_id: row.get(1)?,
            schedule_id: row.get(2)?,
            channel_id: row.get(3)?,
            scheduled_at: row.get(4)?,
            status: row.get(5)?,
            phase: row.get(6)?,
            progress_percent: row.get(7)?,
            attempts: row.get(8)?,
            next_attempt_at: row.get(9)?,
            last_error: row.get(10)?,
            error_phase: row.get(11)?,
            destination_url: row.get(12)?,
            experiment_arm: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }
}

struct RawEntry {
    id: String,
    source_item_id: String,
    schedule_id: String,
    channel_id: String,
    scheduled_at: String,
    status: String,
    phase: Option<String>,
    progress_percent: i64,
    attempts: i64,
    next_attempt_at: Option<String>,
    last_error: Option<String>,
    error_phase: Option<String>,
    destination_url: Option<String>,
    experiment_arm: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawEntry {
    fn into_entry(self) -> StorageResult<QueueEntry> {
        Ok(QueueEntry {
            id: parse_uuid(&self.id)?,
            source_item_id: self.source_item_id,
            schedule_id: parse_uuid(&self.schedule_id)?,
            channel_id: parse_uuid(&self.channel_id)?,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            status: parse_enum(&self.status)?,
            phase: self
                .phase
                .as_deref()
                .map(parse_enum::<ProgressPhase>)
                .transpose()?,
            progress_percent: self.progress_percent as u8,
            attempts: self.attempts as u32,
            next_attempt_at: parse_opt_ts(self.next_attempt_at)?,
            last_error: self.last_error,
            error_phase: self
                .error_phase
                .as_deref()
                .map(parse_enum::<ProgressPhase>)
                .transpose()?,
            destination_url: self.destination_url,
            experiment_arm: self
                .experiment_arm
                .as_deref()
                .map(parse_enum::<ExperimentArm>)
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl QueueRepository for SqliteQueueRepository {
    fn enqueue(&self, entry: &QueueEntry) -> StorageResult<()> {
        let result = self.db.lock().execute(
            &format!("INSERT INTO queue_entries ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"),
            params![
                entry.id.to_string(),
                entry.source_item_id,
                entry.schedule_id.to_string(),
                entry.channel_id.to_string(),
                ts(entry.scheduled_at),
                entry.status.as_str(),
                entry.phase.map(|p| p.as_str()),
                entry.progress_percent as i64,
                entry.attempts as i64,
                entry.next_attempt_at.map(ts),
                entry.last_error,
                entry.error_phase.map(|p| p.as_str()),
                entry.destination_url,
                entry.experiment_arm.map(|a| a.as_str()),
                ts(entry.created_at),
                ts(entry.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::invariant(format!(
                    "source item '{}' already has a pending queue entry",
                    entry.source_item_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<QueueEntry>> {
        let raw = self
            .db
            .lock()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_entry,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    fn entry_for_slot(
        &self,
        schedule_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> StorageResult<Option<QueueEntry>> {
        let raw = self
            .db
            .lock()
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries
                     WHERE schedule_id = ?1 AND scheduled_at = ?2"
                ),
                params![schedule_id.to_string(), ts(scheduled_at)],
                Self::row_to_entry,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    fn has_pending_for_item(&self, source_item_id: &str) -> StorageResult<bool> {
        let count: i64 = self.db.lock().query_row(
            "SELECT COUNT(*) FROM queue_entries
             WHERE source_item_id = ?1 AND status IN ('queued', 'processing')",
            params![source_item_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn has_any_for_item(&self, source_item_id: &str) -> StorageResult<bool> {
        let count: i64 = self.db.lock().query_row(
            "SELECT COUNT(*) FROM queue_entries WHERE source_item_id = ?1",
            params![source_item_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn due_batch(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<QueueEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries
             WHERE status = 'queued' AND scheduled_at <= ?1
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY scheduled_at LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![ts(now), limit as i64], Self::row_to_entry)?;
        let mut entries = Vec::new();
        for raw in rows {
            entries.push(raw?.into_entry()?);
        }
        Ok(entries)
    }

    fn claim(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let changed = self.db.lock().execute(
            "UPDATE queue_entries
             SET status = 'processing', phase = 'downloading', progress_percent = 0,
                 updated_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![ts(now), id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn set_progress(&self, id: Uuid, phase: ProgressPhase, percent: u8) -> StorageResult<()> {
        self.db.lock().execute(
            "UPDATE queue_entries
             SET phase = ?1, progress_percent = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'processing'",
            params![
                phase.as_str(),
                percent.min(100) as i64,
                ts(Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    fn complete_success(&self, id: Uuid, url: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let changed = self.db.lock().execute(
            "UPDATE queue_entries
             SET status = 'published', destination_url = ?1, phase = NULL,
                 progress_percent = 100, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
            params![url, ts(now), id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn reschedule_retry(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let changed = self.db.lock().execute(
            "UPDATE queue_entries
             SET status = 'queued', attempts = ?1, next_attempt_at = ?2,
                 last_error = ?3, error_phase = ?4, phase = NULL, updated_at = ?5
             WHERE id = ?6 AND status = 'processing'",
            params![
                attempts as i64,
                ts(next_attempt_at),
                error,
                phase.map(|p| p.as_str()),
                ts(now),
                id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    fn complete_failure(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let changed = self.db.lock().execute(
            "UPDATE queue_entries
             SET status = 'failed', attempts = ?1, last_error = ?2,
                 error_phase = ?3, phase = NULL, updated_at = ?4
             WHERE id = ?5 AND status = 'processing'",
            params![
                attempts as i64,
                error,
                phase.map(|p| p.as_str()),
                ts(now),
                id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let changed = self.db.lock().execute(
            "UPDATE queue_entries
             SET status = 'queued', next_attempt_at = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'failed'",
            params![ts(now), id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn cancel_queued(&self, schedule_ids: &[Uuid]) -> StorageResult<usize> {
        let conn = self.db.lock();
        let mut cancelled = 0;
        for schedule_id in schedule_ids {
            cancelled += conn.execute(
                "DELETE FROM queue_entries WHERE schedule_id = ?1 AND status = 'queued'",
                params![schedule_id.to_string()],
            )?;
        }
        Ok(cancelled)
    }

    fn stale_processing(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<QueueEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries
             WHERE status = 'processing' AND updated_at < ?1"
        ))?;
        let rows = stmt.query_map(params![ts(cutoff)], Self::row_to_entry)?;
        let mut entries = Vec::new();
        for raw in rows {
            entries.push(raw?.into_entry()?);
        }
        Ok(entries)
    }

    fn outcome_samples(&self, channel_id: Uuid) -> StorageResult<Vec<OutcomeSample>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT updated_at, status FROM queue_entries
             WHERE channel_id = ?1 AND status IN ('published', 'failed')",
        )?;
        let rows = stmt.query_map(params![channel_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut samples = Vec::new();
        for row in rows {
            let (at, status) = row?;
            samples.push(OutcomeSample {
                at: parse_ts(&at)?,
                success: status == "published",
            });
        }
        Ok(samples)
    }

    fn stats(&self) -> StorageResult<QueueStats> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM queue_entries GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "queued" => stats.queued = count as usize,
                "processing" => stats.processing = count as usize,
                "published" => stats.published = count as usize,
                "failed" => stats.failed = count as usize,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// In-memory queue repository
#[derive(Default)]
pub struct MemoryQueueRepository {
    entries: Mutex<HashMap<Uuid, QueueEntry>>,
}

impl MemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueRepository for MemoryQueueRepository {
    fn enqueue(&self, entry: &QueueEntry) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let pending = entries
            .values()
            .any(|e| e.source_item_id == entry.source_item_id && !e.status.is_terminal());
        if pending {
            return Err(StorageError::invariant(format!(
                "source item '{}' already has a pending queue entry",
                entry.source_item_id
            )));
        }
        entries.insert(entry.id, entry.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<QueueEntry>> {
        Ok(self.entries.lock().unwrap().get(&id).cloned())
    }

    fn entry_for_slot(
        &self,
        schedule_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> StorageResult<Option<QueueEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .find(|e| e.schedule_id == schedule_id && e.scheduled_at == scheduled_at)
            .cloned())
    }

    fn has_pending_for_item(&self, source_item_id: &str) -> StorageResult<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .any(|e| e.source_item_id == source_item_id && !e.status.is_terminal()))
    }

    fn has_any_for_item(&self, source_item_id: &str) -> StorageResult<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .any(|e| e.source_item_id == source_item_id))
    }

    fn due_batch(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<QueueEntry>> {
        let mut due: Vec<QueueEntry> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    fn claim(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) if entry.status == QueueStatus::Queued => {
                entry.status = QueueStatus::Processing;
                entry.phase = Some(ProgressPhase::Downloading);
                entry.progress_percent = 0;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_progress(&self, id: Uuid, phase: ProgressPhase, percent: u8) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            if entry.status == QueueStatus::Processing {
                entry.phase = Some(phase);
                entry.progress_percent = percent.min(100);
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    fn complete_success(&self, id: Uuid, url: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) if entry.status == QueueStatus::Processing => {
                entry.status = QueueStatus::Published;
                entry.destination_url = Some(url.to_string());
                entry.phase = None;
                entry.progress_percent = 100;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn reschedule_retry(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) if entry.status == QueueStatus::Processing => {
                entry.status = QueueStatus::Queued;
                entry.attempts = attempts;
                entry.next_attempt_at = Some(next_attempt_at);
                entry.last_error = Some(error.to_string());
                entry.error_phase = phase;
                entry.phase = None;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete_failure(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) if entry.status == QueueStatus::Processing => {
                entry.status = QueueStatus::Failed;
                entry.attempts = attempts;
                entry.last_error = Some(error.to_string());
                entry.error_phase = phase;
                entry.phase = None;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) if entry.status == QueueStatus::Failed => {
                entry.status = QueueStatus::Queued;
                entry.next_attempt_at = None;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn cancel_queued(&self, schedule_ids: &[Uuid]) -> StorageResult<usize> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| {
            !(e.status == QueueStatus::Queued && schedule_ids.contains(&e.schedule_id))
        });
        Ok(before - entries.len())
    }

    fn stale_processing(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<QueueEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == QueueStatus::Processing && e.updated_at < cutoff)
            .cloned()
            .collect())
    }

    fn outcome_samples(&self, channel_id: Uuid) -> StorageResult<Vec<OutcomeSample>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.channel_id == channel_id && e.status.is_terminal())
            .map(|e| OutcomeSample {
                at: e.updated_at,
                success: e.status == QueueStatus::Published,
            })
            .collect())
    }

    fn stats(&self) -> StorageResult<QueueStats> {
        let entries = self.entries.lock().unwrap();
        let mut stats = QueueStats::default();
        for entry in entries.values() {
            match entry.status {
                QueueStatus::Queued => stats.queued += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Published => stats.published += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

// ============================================================================
// Quota Repository
// ============================================================================

/// Daily upload counters per channel
pub trait QuotaRepository: Send + Sync {
    fn usage(&self, channel_id: Uuid, date: NaiveDate) -> StorageResult<u32>;
    /// Atomic increment; returns the new usage
    fn increment_usage(&self, channel_id: Uuid, date: NaiveDate) -> StorageResult<u32>;
}

pub struct SqliteQuotaRepository {
    db: Arc<Database>,
}

impl SqliteQuotaRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl QuotaRepository for SqliteQuotaRepository {
    fn usage(&self, channel_id: Uuid, date: NaiveDate) -> StorageResult<u32> {
        let used: Option<i64> = self
            .db
            .lock()
            .query_row(
                "SELECT used FROM quota_usage WHERE channel_id = ?1 AND date = ?2",
                params![channel_id.to_string(), date.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(used.unwrap_or(0) as u32)
    }

    fn increment_usage(&self, channel_id: Uuid, date: NaiveDate) -> StorageResult<u32> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO quota_usage (channel_id, date, used) VALUES (?1, ?2, 1)
             ON CONFLICT(channel_id, date) DO UPDATE SET used = used + 1",
            params![channel_id.to_string(), date.to_string()],
        )?;
        let used: i64 = conn.query_row(
            "SELECT used FROM quota_usage WHERE channel_id = ?1 AND date = ?2",
            params![channel_id.to_string(), date.to_string()],
            |row| row.get(0),
        )?;
        Ok(used as u32)
    }
}

/// In-memory quota repository
#[derive(Default)]
pub struct MemoryQuotaRepository {
    usage: Mutex<HashMap<(Uuid, NaiveDate), u32>>,
}

impl MemoryQuotaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaRepository for MemoryQuotaRepository {
    fn usage(&self, channel_id: Uuid, date: NaiveDate) -> StorageResult<u32> {
        Ok(*self
            .usage
            .lock()
            .unwrap()
            .get(&(channel_id, date))
            .unwrap_or(&0))
    }

    fn increment_usage(&self, channel_id: Uuid, date: NaiveDate) -> StorageResult<u32> {
        let mut usage = self.usage.lock().unwrap();
        let counter = usage.entry((channel_id, date)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

// ============================================================================
// Health Repository
// ============================================================================

/// Persistence for channel health records
pub trait HealthRepository: Send + Sync {
    fn get_or_create(&self, channel_id: Uuid) -> anyhow::Result<HealthRecord>;
    fn update(&self, record: &HealthRecord) -> anyhow::Result<()>;
    fn list(&self) -> anyhow::Result<Vec<HealthRecord>>;
}

pub struct SqliteHealthRepository {
    db: Arc<Database>,
}

impl SqliteHealthRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawHealth> {
        Ok(RawHealth {
            channel_id: row.get(0)?,
            successes: row.get(1)?,
            failures: row.get(2)?,
            consecutive_failures: row.get(3)?,
            circuit_state: row.get(4)?,
            probe_in_flight: row.get(5)?,
            last_failure_at: row.get(6)?,
            last_error: row.get(7)?,
            last_error_phase: row.get(8)?,
            last_checked_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

struct RawHealth {
    channel_id: String,
    successes: i64,
    failures: i64,
    consecutive_failures: i64,
    circuit_state: String,
    probe_in_flight: i64,
    last_failure_at: Option<String>,
    last_error: Option<String>,
    last_error_phase: Option<String>,
    last_checked_at: Option<String>,
    updated_at: String,
}

impl RawHealth {
    fn into_record(self) -> StorageResult<HealthRecord> {
        Ok(HealthRecord {
            channel_id: parse_uuid(&self.channel_id)?,
            successes: self.successes as u64,
            failures: self.failures as u64,
            consecutive_failures: self.consecutive_failures as u32,
            circuit_state: parse_enum::<CircuitState>(&self.circuit_state)?,
            probe_in_flight: self.probe_in_flight != 0,
            last_failure_at: parse_opt_ts(self.last_failure_at)?,
            last_error: self.last_error,
            last_error_phase: self
                .last_error_phase
                .as_deref()
                .map(parse_enum::<ProgressPhase>)
                .transpose()?,
            last_checked_at: parse_opt_ts(self.last_checked_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const HEALTH_COLUMNS: &str = "channel_id, successes, failures, consecutive_failures, \
                              circuit_state, probe_in_flight, last_failure_at, last_error, \
                              last_error_phase, last_checked_at, updated_at";

impl HealthRepository for SqliteHealthRepository {
    fn get_or_create(&self, channel_id: Uuid) -> anyhow::Result<HealthRecord> {
        let existing = self
            .db
            .lock()
            .query_row(
                &format!("SELECT {HEALTH_COLUMNS} FROM health_records WHERE channel_id = ?1"),
                params![channel_id.to_string()],
                Self::row_to_record,
            )
            .optional()
            .map_err(StorageError::from)?;

        if let Some(raw) = existing {
            return Ok(raw.into_record()?);
        }

        let record = HealthRecord::new(channel_id);
        self.update(&record)?;
        Ok(record)
    }

    fn update(&self, record: &HealthRecord) -> anyhow::Result<()> {
        self.db
            .lock()
            .execute(
                &format!(
                    "INSERT INTO health_records ({HEALTH_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(channel_id) DO UPDATE SET
                        successes = excluded.successes,
                        failures = excluded.failures,
                        consecutive_failures = excluded.consecutive_failures,
                        circuit_state = excluded.circuit_state,
                        probe_in_flight = excluded.probe_in_flight,
                        last_failure_at = excluded.last_failure_at,
                        last_error = excluded.last_error,
                        last_error_phase = excluded.last_error_phase,
                        last_checked_at = excluded.last_checked_at,
                        updated_at = excluded.updated_at"
                ),
                params![
                    record.channel_id.to_string(),
                    record.successes as i64,
                    record.failures as i64,
                    record.consecutive_failures as i64,
                    record.circuit_state.as_str(),
                    record.probe_in_flight as i64,
                    record.last_failure_at.map(ts),
                    record.last_error,
                    record.last_error_phase.map(|p| p.as_str()),
                    record.last_checked_at.map(ts),
                    ts(record.updated_at),
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<HealthRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {HEALTH_COLUMNS} FROM health_records"))
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], Self::row_to_record)
            .map_err(StorageError::from)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw.map_err(StorageError::from)?.into_record()?);
        }
        Ok(records)
    }
}

/// In-memory health repository
#[derive(Default)]
pub struct MemoryHealthRepository {
    records: Mutex<HashMap<Uuid, HealthRecord>>,
}

impl MemoryHealthRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HealthRepository for MemoryHealthRepository {
    fn get_or_create(&self, channel_id: Uuid) -> anyhow::Result<HealthRecord> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_insert_with(|| HealthRecord::new(channel_id))
            .clone())
    }

    fn update(&self, record: &HealthRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.channel_id, record.clone());
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<HealthRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
}

// ============================================================================
// A/B Test Repository
// ============================================================================

/// Persistence for experiments; one per schedule
pub trait AbTestRepository: Send + Sync {
    fn insert(&self, test: &AbTest) -> StorageResult<()>;
    fn get(&self, id: Uuid) -> StorageResult<Option<AbTest>>;
    fn for_schedule(&self, schedule_id: Uuid) -> StorageResult<Option<AbTest>>;
    fn update(&self, test: &AbTest) -> StorageResult<()>;
}

pub struct SqliteAbTestRepository {
    db: Arc<Database>,
}

const AB_COLUMNS: &str = "id, schedule_id, status, variant_a_name, variant_a_slots, \
                          variant_a_uploads, variant_a_successes, variant_b_name, \
                          variant_b_slots, variant_b_uploads, variant_b_successes, winner, \
                          created_at, completed_at";

impl SqliteAbTestRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_test(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAbTest> {
        Ok(RawAbTest {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            status: row.get(2)?,
            variant_a_name: row.get(3)?,
            variant_a_slots: row.get(4)?,
            variant_a_uploads: row.get(5)?,
            variant_a_successes: row.get(6)?,
            variant_b_name: row.get(7)?,
            variant_b_slots: row.get(8)?,
            variant_b_uploads: row.get(9)?,
            variant_b_successes: row.get(10)?,
            winner: row.get(11)?,
            created_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    fn upsert(&self, test: &AbTest, insert: bool) -> StorageResult<()> {
        let sql = if insert {
            format!(
                "INSERT INTO ab_tests ({AB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            )
        } else {
            "UPDATE ab_tests SET
                schedule_id = ?2, status = ?3,
                variant_a_name = ?4, variant_a_slots = ?5,
                variant_a_uploads = ?6, variant_a_successes = ?7,
                variant_b_name = ?8, variant_b_slots = ?9,
                variant_b_uploads = ?10, variant_b_successes = ?11,
                winner = ?12, created_at = ?13, completed_at = ?14
             WHERE id = ?1"
                .to_string()
        };
        let changed = self.db.lock().execute(
            &sql,
            params![
                test.id.to_string(),
                test.schedule_id.to_string(),
                test.status.as_str(),
                test.variant_a.name,
                serde_json::to_string(&test.variant_a.slots)
                    .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
                test.variant_a.uploads as i64,
                test.variant_a.successes as i64,
                test.variant_b.name,
                serde_json::to_string(&test.variant_b.slots)
                    .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
                test.variant_b.uploads as i64,
                test.variant_b.successes as i64,
                test.winner.map(|w| w.as_str()),
                ts(test.created_at),
                test.completed_at.map(ts),
            ],
        )?;
        if !insert && changed == 0 {
            return Err(StorageError::not_found("ab_test", test.id));
        }
        Ok(())
    }
}

struct RawAbTest {
    id: String,
    schedule_id: String,
    status: String,
    variant_a_name: String,
    variant_a_slots: String,
    variant_a_uploads: i64,
    variant_a_successes: i64,
    variant_b_name: String,
    variant_b_slots: String,
    variant_b_uploads: i64,
    variant_b_successes: i64,
    winner: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl RawAbTest {
    fn into_test(self) -> StorageResult<AbTest> {
        Ok(AbTest {
            id: parse_uuid(&self.id)?,
            schedule_id: parse_uuid(&self.schedule_id)?,
            status: parse_enum::<TestStatus>(&self.status)?,
            variant_a: Variant {
                name: self.variant_a_name,
                slots: parse_json(&self.variant_a_slots)?,
                uploads: self.variant_a_uploads as u64,
                successes: self.variant_a_successes as u64,
            },
            variant_b: Variant {
                name: self.variant_b_name,
                slots: parse_json(&self.variant_b_slots)?,
                uploads: self.variant_b_uploads as u64,
                successes: self.variant_b_successes as u64,
            },
            winner: self
                .winner
                .as_deref()
                .map(parse_enum::<ExperimentArm>)
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

impl AbTestRepository for SqliteAbTestRepository {
    fn insert(&self, test: &AbTest) -> StorageResult<()> {
        self.upsert(test, true)
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<AbTest>> {
        let raw = self
            .db
            .lock()
            .query_row(
                &format!("SELECT {AB_COLUMNS} FROM ab_tests WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_test,
            )
            .optional()?;
        raw.map(RawAbTest::into_test).transpose()
    }

    fn for_schedule(&self, schedule_id: Uuid) -> StorageResult<Option<AbTest>> {
        let raw = self
            .db
            .lock()
            .query_row(
                &format!("SELECT {AB_COLUMNS} FROM ab_tests WHERE schedule_id = ?1"),
                params![schedule_id.to_string()],
                Self::row_to_test,
            )
            .optional()?;
        raw.map(RawAbTest::into_test).transpose()
    }

    fn update(&self, test: &AbTest) -> StorageResult<()> {
        self.upsert(test, false)
    }
}

/// In-memory A/B test repository
#[derive(Default)]
pub struct MemoryAbTestRepository {
    tests: Mutex<HashMap<Uuid, AbTest>>,
}

impl MemoryAbTestRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AbTestRepository for MemoryAbTestRepository {
    fn insert(&self, test: &AbTest) -> StorageResult<()> {
        self.tests.lock().unwrap().insert(test.id, test.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<AbTest>> {
        Ok(self.tests.lock().unwrap().get(&id).cloned())
    }

    fn for_schedule(&self, schedule_id: Uuid) -> StorageResult<Option<AbTest>> {
        Ok(self
            .tests
            .lock()
            .unwrap()
            .values()
            .find(|t| t.schedule_id == schedule_id)
            .cloned())
    }

    fn update(&self, test: &AbTest) -> StorageResult<()> {
        let mut tests = self.tests.lock().unwrap();
        if !tests.contains_key(&test.id) {
            return Err(StorageError::not_found("ab_test", test.id));
        }
        tests.insert(test.id, test.clone());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RotationStrategy, Schedule};
    use crate::storage::Store;
    use chrono::Duration;

    fn stores() -> Vec<Store> {
        vec![Store::sqlite_in_memory().unwrap(), Store::memory()]
    }

    fn sample_entry(scheduled_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry::new(
            Uuid::new_v4().to_string(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            scheduled_at,
        )
    }

    #[test]
    fn test_channel_round_trip() {
        for store in stores() {
            let channel = Channel::new(Uuid::new_v4(), "main channel")
                .with_timezone(chrono_tz::Europe::Berlin);
            store.channels.insert(&channel).unwrap();

            let loaded = store.channels.get(channel.id).unwrap().unwrap();
            assert_eq!(loaded.display_name, "main channel");
            assert_eq!(loaded.timezone, Some(chrono_tz::Europe::Berlin));
            assert_eq!(loaded.auth_status, AuthStatus::Pending);

            store
                .channels
                .set_auth_status(channel.id, AuthStatus::Connected)
                .unwrap();
            let loaded = store.channels.get(channel.id).unwrap().unwrap();
            assert_eq!(loaded.auth_status, AuthStatus::Connected);
        }
    }

    #[test]
    fn test_pool_member_priority_collision_rejected() {
        for store in stores() {
            let mut pool = Pool::new("collide", RotationStrategy::Priority);
            let c1 = Uuid::new_v4();
            pool.members.push(PoolMember::new(c1, 1));
            store.pools.insert(&pool).unwrap();

            let err = store
                .pools
                .add_member(pool.id, &PoolMember::new(Uuid::new_v4(), 1))
                .unwrap_err();
            assert!(matches!(err, StorageError::InvariantViolation(_)));
        }
    }

    #[test]
    fn test_pool_cursor_guarded_update() {
        for store in stores() {
            let pool = Pool::new("cursor", RotationStrategy::RoundRobin);
            store.pools.insert(&pool).unwrap();

            assert!(store.pools.update_cursor(pool.id, 0, 2).unwrap());
            // Stale expectation loses
            assert!(!store.pools.update_cursor(pool.id, 0, 3).unwrap());
            assert!(store.pools.update_cursor(pool.id, 2, 3).unwrap());

            let loaded = store.pools.get(pool.id).unwrap().unwrap();
            assert_eq!(loaded.last_selected_index, 3);
        }
    }

    #[test]
    fn test_one_schedule_per_destination_channel() {
        for store in stores() {
            let channel_id = Uuid::new_v4();
            let first = Schedule::new(
                Uuid::new_v4(),
                Destination::Channel(channel_id),
                chrono_tz::UTC,
            );
            store.schedules.insert(&first).unwrap();

            let second = Schedule::new(
                Uuid::new_v4(),
                Destination::Channel(channel_id),
                chrono_tz::UTC,
            );
            let err = store.schedules.insert(&second).unwrap_err();
            assert!(matches!(err, StorageError::InvariantViolation(_)));

            // Pools are not subject to the invariant
            let pool_id = Uuid::new_v4();
            let a = Schedule::new(Uuid::new_v4(), Destination::Pool(pool_id), chrono_tz::UTC);
            let b = Schedule::new(Uuid::new_v4(), Destination::Pool(pool_id), chrono_tz::UTC);
            store.schedules.insert(&a).unwrap();
            store.schedules.insert(&b).unwrap();
        }
    }

    #[test]
    fn test_duplicate_pending_entry_rejected() {
        for store in stores() {
            let now = Utc::now();
            let mut entry = sample_entry(now);
            entry.source_item_id = "clip-77".into();
            store.queue.enqueue(&entry).unwrap();

            let mut dup = sample_entry(now + Duration::hours(1));
            dup.source_item_id = "clip-77".into();
            let err = store.queue.enqueue(&dup).unwrap_err();
            assert!(matches!(err, StorageError::InvariantViolation(_)));

            // A terminal entry frees the item for re-enqueue
            assert!(store.queue.claim(entry.id, now).unwrap());
            assert!(store
                .queue
                .complete_failure(entry.id, 3, "gone", None, now)
                .unwrap());
            store.queue.enqueue(&dup).unwrap();
        }
    }

    #[test]
    fn test_due_batch_ordering_and_backoff() {
        for store in stores() {
            let now = Utc::now();
            let late = sample_entry(now - Duration::minutes(5));
            let early = sample_entry(now - Duration::minutes(30));
            let future = sample_entry(now + Duration::minutes(30));
            let mut backed_off = sample_entry(now - Duration::minutes(60));
            backed_off.next_attempt_at = Some(now + Duration::minutes(4));

            for entry in [&late, &early, &future, &backed_off] {
                store.queue.enqueue(entry).unwrap();
            }

            // The future entry is not due and the backed-off entry is held
            // past its next_attempt_at; the rest come back oldest first.
            let batch = store.queue.due_batch(now, 10).unwrap();
            let ids: Vec<Uuid> = batch.iter().map(|e| e.id).collect();
            assert_eq!(ids, vec![early.id, late.id]);

            // Limit truncates from the front of the order
            let batch = store.queue.due_batch(now, 1).unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].id, early.id);
        }
    }

    #[test]
    fn test_claim_and_terminal_transitions_guarded() {
        for store in stores() {
            let now = Utc::now();
            let entry = sample_entry(now - Duration::minutes(1));
            store.queue.enqueue(&entry).unwrap();

            assert!(store.queue.claim(entry.id, now).unwrap());
            // Double claim refused
            assert!(!store.queue.claim(entry.id, now).unwrap());

            assert!(store
                .queue
                .complete_success(entry.id, "https://videos.example/1", now)
                .unwrap());
            // Completing again is a no-op
            assert!(!store
                .queue
                .complete_success(entry.id, "https://videos.example/1", now)
                .unwrap());
            assert!(!store
                .queue
                .complete_failure(entry.id, 1, "late", None, now)
                .unwrap());

            let loaded = store.queue.get(entry.id).unwrap().unwrap();
            assert_eq!(loaded.status, QueueStatus::Published);
            assert_eq!(
                loaded.destination_url.as_deref(),
                Some("https://videos.example/1")
            );
        }
    }

    #[test]
    fn test_cancel_only_queued() {
        for store in stores() {
            let now = Utc::now();
            let schedule_id = Uuid::new_v4();
            let mut queued = sample_entry(now);
            queued.schedule_id = schedule_id;
            let mut processing = sample_entry(now);
            processing.schedule_id = schedule_id;

            store.queue.enqueue(&queued).unwrap();
            store.queue.enqueue(&processing).unwrap();
            assert!(store.queue.claim(processing.id, now).unwrap());

            let cancelled = store.queue.cancel_queued(&[schedule_id]).unwrap();
            assert_eq!(cancelled, 1);
            assert!(store.queue.get(queued.id).unwrap().is_none());
            assert!(store.queue.get(processing.id).unwrap().is_some());
        }
    }

    #[test]
    fn test_quota_increment_atomicity() {
        for store in stores() {
            let channel_id = Uuid::new_v4();
            let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

            assert_eq!(store.quota.usage(channel_id, date).unwrap(), 0);
            assert_eq!(store.quota.increment_usage(channel_id, date).unwrap(), 1);
            assert_eq!(store.quota.increment_usage(channel_id, date).unwrap(), 2);
            assert_eq!(store.quota.usage(channel_id, date).unwrap(), 2);

            // Different day starts fresh
            let next_day = date.succ_opt().unwrap();
            assert_eq!(store.quota.usage(channel_id, next_day).unwrap(), 0);
        }
    }

    #[test]
    fn test_health_record_round_trip() {
        for store in stores() {
            let channel_id = Uuid::new_v4();
            let mut record = store.health.get_or_create(channel_id).unwrap();
            assert_eq!(record.circuit_state, CircuitState::Closed);

            record.successes = 4;
            record.failures = 2;
            record.circuit_state = CircuitState::Open;
            record.last_error = Some("boom".into());
            record.last_error_phase = Some(ProgressPhase::Uploading);
            store.health.update(&record).unwrap();

            let loaded = store.health.get_or_create(channel_id).unwrap();
            assert_eq!(loaded.successes, 4);
            assert_eq!(loaded.circuit_state, CircuitState::Open);
            assert_eq!(loaded.last_error_phase, Some(ProgressPhase::Uploading));
        }
    }

    #[test]
    fn test_ab_test_round_trip() {
        for store in stores() {
            let schedule_id = Uuid::new_v4();
            let mut test = AbTest::new(
                schedule_id,
                Variant::new("morning", vec![]),
                Variant::new("evening", vec![]),
            );
            store.ab_tests.insert(&test).unwrap();

            test.assign_upload().unwrap();
            test.record_outcome(ExperimentArm::A, true).unwrap();
            store.ab_tests.update(&test).unwrap();

            let loaded = store.ab_tests.for_schedule(schedule_id).unwrap().unwrap();
            assert_eq!(loaded.variant_a.uploads, 1);
            assert_eq!(loaded.variant_a.successes, 1);
            assert_eq!(loaded.status, TestStatus::Running);
        }
    }

    #[test]
    fn test_outcome_samples_only_terminal() {
        for store in stores() {
            let now = Utc::now();
            let channel_id = Uuid::new_v4();

            let mut ok = sample_entry(now);
            ok.channel_id = channel_id;
            let mut bad = sample_entry(now);
            bad.channel_id = channel_id;
            let mut pending = sample_entry(now);
            pending.channel_id = channel_id;

            for entry in [&ok, &bad, &pending] {
                store.queue.enqueue(entry).unwrap();
            }
            store.queue.claim(ok.id, now).unwrap();
            store.queue.complete_success(ok.id, "https://x", now).unwrap();
            store.queue.claim(bad.id, now).unwrap();
            store
                .queue
                .complete_failure(bad.id, 3, "no", None, now)
                .unwrap();

            let samples = store.queue.outcome_samples(channel_id).unwrap();
            assert_eq!(samples.len(), 2);
            assert_eq!(samples.iter().filter(|s| s.success).count(), 1);
        }
    }
}
