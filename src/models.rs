//! Core data structures for the clipcast publish engine
//!
//! Entities here are the persisted vocabulary of the engine: destination
//! channels, rotation pools, schedules, queue entries, and the engine-side
//! view of importable source items. Component-specific records (health,
//! experiments) live with their components.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Authorization Status
// ============================================================================

/// Authorization state of a destination channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    /// Channel created but credentials not yet exchanged
    Pending,
    /// Credentials valid, channel may receive uploads
    Connected,
    /// Token revoked by the destination platform
    TokenRevoked,
    /// Destination API not enabled for this account
    ApiNotEnabled,
    /// Credential exchange failed
    Failed,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::TokenRevoked => "token_revoked",
            Self::ApiNotEnabled => "api_not_enabled",
            Self::Failed => "failed",
        }
    }

    /// Whether the channel can be handed to the publish operation at all
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether re-authorization by the operator is required
    pub fn needs_reauth(&self) -> bool {
        matches!(self, Self::TokenRevoked | Self::ApiNotEnabled | Self::Failed)
    }
}

impl FromStr for AuthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "connected" => Ok(Self::Connected),
            "token_revoked" => Ok(Self::TokenRevoked),
            "api_not_enabled" => Ok(Self::ApiNotEnabled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown auth status: {other}")),
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A destination account capable of receiving uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Channel identifier
    pub id: Uuid,

    /// Owning operator account
    pub account_id: Uuid,

    /// Human-readable name shown in logs and events
    pub display_name: String,

    /// Current authorization state
    pub auth_status: AuthStatus,

    /// Owner's configured timezone; quota windows reset at this zone's
    /// midnight. UTC is assumed when unset.
    pub timezone: Option<Tz>,

    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(account_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            display_name: display_name.into(),
            auth_status: AuthStatus::Pending,
            timezone: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    /// Effective timezone for quota accounting
    pub fn effective_timezone(&self) -> Tz {
        self.timezone.unwrap_or(chrono_tz::UTC)
    }

    /// Local calendar date of `at` in the channel's quota window
    pub fn local_date(&self, at: DateTime<Utc>) -> chrono::NaiveDate {
        at.with_timezone(&self.effective_timezone()).date_naive()
    }
}

// ============================================================================
// Rotation Strategy & Pool
// ============================================================================

/// Strategy used to pick the next channel from a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Highest remaining daily quota wins
    QuotaBased,
    /// Cyclic order, resuming after the last selected member
    RoundRobin,
    /// Lowest priority value wins
    Priority,
}

impl RotationStrategy {
    pub fn all() -> Vec<Self> {
        vec![Self::QuotaBased, Self::RoundRobin, Self::Priority]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaBased => "quota_based",
            Self::RoundRobin => "round_robin",
            Self::Priority => "priority",
        }
    }
}

impl FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quota_based" => Ok(Self::QuotaBased),
            "round_robin" => Ok(Self::RoundRobin),
            "priority" => Ok(Self::Priority),
            other => Err(format!("unknown rotation strategy: {other}")),
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Membership of a channel in a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMember {
    pub channel_id: Uuid,

    /// Rank within the pool; lower is preferred. Unique per pool.
    pub priority: u32,

    /// Fallback members are skipped until every non-fallback member is
    /// exhausted or unhealthy.
    pub is_fallback_only: bool,
}

impl PoolMember {
    pub fn new(channel_id: Uuid, priority: u32) -> Self {
        Self {
            channel_id,
            priority,
            is_fallback_only: false,
        }
    }

    pub fn fallback(channel_id: Uuid, priority: u32) -> Self {
        Self {
            channel_id,
            priority,
            is_fallback_only: true,
        }
    }
}

/// An ordered collection of channels sharing a rotation strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,

    pub name: String,

    pub strategy: RotationStrategy,

    pub active: bool,

    /// Cursor for round-robin selection. Persisted only after a selection
    /// succeeds, with a guarded update.
    pub last_selected_index: u32,

    /// Members ordered by priority value
    pub members: Vec<PoolMember>,
}

impl Pool {
    pub fn new(name: impl Into<String>, strategy: RotationStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            strategy,
            active: true,
            last_selected_index: 0,
            members: Vec::new(),
        }
    }

    /// Add a member, rejecting a priority already taken within this pool
    pub fn add_member(&mut self, member: PoolMember) -> Result<(), String> {
        if self.members.iter().any(|m| m.priority == member.priority) {
            return Err(format!(
                "priority {} already assigned in pool '{}'",
                member.priority, self.name
            ));
        }
        self.members.push(member);
        self.members.sort_by_key(|m| m.priority);
        Ok(())
    }

    pub fn remove_member(&mut self, channel_id: Uuid) {
        self.members.retain(|m| m.channel_id != channel_id);
    }

    pub fn non_fallback_members(&self) -> impl Iterator<Item = &PoolMember> {
        self.members.iter().filter(|m| !m.is_fallback_only)
    }

    pub fn fallback_members(&self) -> impl Iterator<Item = &PoolMember> {
        self.members.iter().filter(|m| m.is_fallback_only)
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Lifecycle state of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    /// Terminal
    Deleted,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// Where a schedule sends its uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum Destination {
    /// A single bound channel
    Channel(Uuid),
    /// A rotation pool
    Pool(Uuid),
}

/// Binding of a source account to a destination with fixed daily publish times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,

    /// Source account whose importable items feed this schedule
    pub source_account_id: Uuid,

    pub destination: Destination,

    /// Daily publish times, interpreted in `timezone`
    pub publish_times: Vec<NaiveTime>,

    /// Timezone the publish times are expressed in
    pub timezone: Tz,

    pub status: ScheduleStatus,

    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(source_account_id: Uuid, destination: Destination, timezone: Tz) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_account_id,
            destination,
            publish_times: Vec::new(),
            timezone,
            status: ScheduleStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Parse and add an HH:MM publish time
    pub fn add_publish_time(&mut self, hhmm: &str) -> Result<(), String> {
        let time = NaiveTime::parse_from_str(hhmm, "%H:%M")
            .map_err(|_| format!("invalid publish time '{hhmm}', expected HH:MM"))?;
        if !self.publish_times.contains(&time) {
            self.publish_times.push(time);
            self.publish_times.sort();
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }
}

// ============================================================================
// Experiment Arm
// ============================================================================

/// Which A/B time variant an upload was assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentArm {
    A,
    B,
}

impl ExperimentArm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl FromStr for ExperimentArm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            other => Err(format!("unknown experiment arm: {other}")),
        }
    }
}

impl fmt::Display for ExperimentArm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Queue Entry
// ============================================================================

/// Lifecycle status of a queue entry
///
/// Transitions are monotonic (`queued` → `processing` → `published` |
/// `failed`) except for the retry edge `failed` → `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Published,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase of an in-flight publish operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Downloading,
    Uploading,
    Finalizing,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Finalizing => "finalizing",
        }
    }
}

impl FromStr for ProgressPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downloading" => Ok(Self::Downloading),
            "uploading" => Ok(Self::Uploading),
            "finalizing" => Ok(Self::Finalizing),
            other => Err(format!("unknown progress phase: {other}")),
        }
    }
}

impl fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One scheduled unit of publish work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,

    /// Source item this entry will publish
    pub source_item_id: String,

    pub schedule_id: Uuid,

    /// Resolved destination channel
    pub channel_id: Uuid,

    /// When this entry becomes due
    pub scheduled_at: DateTime<Utc>,

    pub status: QueueStatus,

    /// Current phase while `processing`
    pub phase: Option<ProgressPhase>,

    /// Phase completion, 0-100, while `processing`
    pub progress_percent: u8,

    /// Publish attempts made so far
    pub attempts: u32,

    /// Earliest time of the next attempt after a retryable failure
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Phase the last error occurred in
    pub error_phase: Option<ProgressPhase>,

    /// Destination URL reported on success
    pub destination_url: Option<String>,

    /// A/B variant this upload was assigned to, when the schedule runs a test
    pub experiment_arm: Option<ExperimentArm>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(
        source_item_id: impl Into<String>,
        schedule_id: Uuid,
        channel_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_item_id: source_item_id.into(),
            schedule_id,
            channel_id,
            scheduled_at,
            status: QueueStatus::Queued,
            phase: None,
            progress_percent: 0,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            error_phase: None,
            destination_url: None,
            experiment_arm: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the entry is due for processing at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Queued
            && self.scheduled_at <= now
            && self.next_attempt_at.map_or(true, |t| t <= now)
    }
}

// ============================================================================
// Source Item
// ============================================================================

/// Engine-side view of an importable item from the scraping subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    /// Stable identifier assigned by the scraper
    pub id: String,

    pub source_account_id: Uuid,

    /// Opaque download reference handed to the publish operation
    pub download_ref: String,

    pub title: String,

    /// Set by the scraper when the item was already posted upstream
    pub already_published: bool,

    pub discovered_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_status_round_trip() {
        for status in [
            AuthStatus::Pending,
            AuthStatus::Connected,
            AuthStatus::TokenRevoked,
            AuthStatus::ApiNotEnabled,
            AuthStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<AuthStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_auth_status_usable() {
        assert!(AuthStatus::Connected.is_usable());
        assert!(!AuthStatus::Pending.is_usable());
        assert!(AuthStatus::TokenRevoked.needs_reauth());
        assert!(!AuthStatus::Connected.needs_reauth());
    }

    #[test]
    fn test_rotation_strategy_round_trip() {
        for strategy in RotationStrategy::all() {
            assert_eq!(
                strategy.as_str().parse::<RotationStrategy>().unwrap(),
                strategy
            );
        }
        assert!("random".parse::<RotationStrategy>().is_err());
    }

    #[test]
    fn test_pool_rejects_priority_collision() {
        let mut pool = Pool::new("test", RotationStrategy::Priority);
        pool.add_member(PoolMember::new(Uuid::new_v4(), 1)).unwrap();
        let err = pool.add_member(PoolMember::new(Uuid::new_v4(), 1));
        assert!(err.is_err());
        assert_eq!(pool.members.len(), 1);
    }

    #[test]
    fn test_pool_members_sorted_by_priority() {
        let mut pool = Pool::new("test", RotationStrategy::Priority);
        pool.add_member(PoolMember::new(Uuid::new_v4(), 3)).unwrap();
        pool.add_member(PoolMember::new(Uuid::new_v4(), 1)).unwrap();
        pool.add_member(PoolMember::new(Uuid::new_v4(), 2)).unwrap();

        let priorities: Vec<u32> = pool.members.iter().map(|m| m.priority).collect();
        assert_eq!(priorities, vec![1, 2, 3]);
    }

    #[test]
    fn test_pool_fallback_split() {
        let mut pool = Pool::new("test", RotationStrategy::QuotaBased);
        pool.add_member(PoolMember::new(Uuid::new_v4(), 1)).unwrap();
        pool.add_member(PoolMember::fallback(Uuid::new_v4(), 2))
            .unwrap();

        assert_eq!(pool.non_fallback_members().count(), 1);
        assert_eq!(pool.fallback_members().count(), 1);
    }

    #[test]
    fn test_schedule_publish_time_parsing() {
        let mut schedule = Schedule::new(
            Uuid::new_v4(),
            Destination::Channel(Uuid::new_v4()),
            chrono_tz::America::New_York,
        );

        schedule.add_publish_time("19:30").unwrap();
        schedule.add_publish_time("09:00").unwrap();
        schedule.add_publish_time("19:30").unwrap(); // duplicate ignored
        assert!(schedule.add_publish_time("25:00").is_err());

        assert_eq!(schedule.publish_times.len(), 2);
        assert!(schedule.publish_times[0] < schedule.publish_times[1]);
    }

    #[test]
    fn test_queue_status_terminal() {
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(QueueStatus::Published.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
    }

    #[test]
    fn test_queue_entry_due() {
        let now = Utc::now();
        let mut entry = QueueEntry::new(
            "item-1",
            Uuid::new_v4(),
            Uuid::new_v4(),
            now - chrono::Duration::minutes(1),
        );
        assert!(entry.is_due(now));

        // Backoff pushes the entry past `now`
        entry.next_attempt_at = Some(now + chrono::Duration::minutes(2));
        assert!(!entry.is_due(now));

        entry.next_attempt_at = None;
        entry.status = QueueStatus::Processing;
        assert!(!entry.is_due(now));
    }

    #[test]
    fn test_channel_local_date_uses_timezone() {
        let channel = Channel::new(Uuid::new_v4(), "test").with_timezone(chrono_tz::Asia::Tokyo);

        // 2024-01-15 20:00 UTC is already 2024-01-16 in Tokyo
        let at = chrono::DateTime::parse_from_rfc3339("2024-01-15T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            channel.local_date(at),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 16).unwrap()
        );
    }

    #[test]
    fn test_destination_serde() {
        let dest = Destination::Pool(Uuid::new_v4());
        let json = serde_json::to_string(&dest).unwrap();
        let back: Destination = serde_json::from_str(&json).unwrap();
        assert_eq!(dest, back);
    }
}
