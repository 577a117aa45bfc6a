//! Destination channel selection
//!
//! Given a schedule's destination (a single channel or a pool), the selector
//! produces exactly one eligible channel for the next upload slot, or reports
//! that none qualifies. A channel is eligible when its authorization is
//! usable, its circuit is closed (or dispensing a half-open probe), and it
//! has remaining daily quota.
//!
//! Strategy dispatch is an explicit match over [`RotationStrategy`]; there is
//! no randomness anywhere, so identical inputs always produce the same
//! selection.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::health::HealthMonitor;
use crate::models::{Channel, Destination, Pool, RotationStrategy};
use crate::quota::QuotaTracker;
use crate::storage::repository::{ChannelRepository, PoolRepository};

// ============================================================================
// Selection Result
// ============================================================================

/// Outcome of a selection attempt
#[derive(Debug, Clone)]
pub enum Selection {
    /// The channel to receive the next upload
    Selected(Channel),
    /// Nothing qualifies right now; the slot is skipped, not failed
    NoEligibleChannel,
}

impl Selection {
    pub fn channel(self) -> Option<Channel> {
        match self {
            Self::Selected(channel) => Some(channel),
            Self::NoEligibleChannel => None,
        }
    }
}

/// A pool member that passed every eligibility gate
#[derive(Debug, Clone)]
struct Candidate {
    channel: Channel,
    priority: u32,
    /// Position in the pool's member list, for cursor bookkeeping
    index: usize,
    remaining: u32,
}

// ============================================================================
// Rotation Selector
// ============================================================================

/// Picks the next destination channel for an upload slot
pub struct RotationSelector {
    channels: Arc<dyn ChannelRepository>,
    pools: Arc<dyn PoolRepository>,
    quota: Arc<QuotaTracker>,
    health: Arc<HealthMonitor>,
}

impl RotationSelector {
    pub fn new(
        channels: Arc<dyn ChannelRepository>,
        pools: Arc<dyn PoolRepository>,
        quota: Arc<QuotaTracker>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            channels,
            pools,
            quota,
            health,
        }
    }

    /// Resolve a schedule destination to one eligible channel
    pub async fn select(
        &self,
        destination: Destination,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Selection> {
        match destination {
            Destination::Channel(channel_id) => self.select_single(channel_id, now).await,
            Destination::Pool(pool_id) => self.select_from_pool(pool_id, now).await,
        }
    }

    async fn select_single(
        &self,
        channel_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Selection> {
        let Some(channel) = self.channels.get(channel_id)? else {
            return Ok(Selection::NoEligibleChannel);
        };
        if let Some(candidate) = self.qualify(&channel, 0, 0, now).await? {
            if self.health.begin_attempt(candidate.channel.id, now)? {
                return Ok(Selection::Selected(candidate.channel));
            }
        }
        Ok(Selection::NoEligibleChannel)
    }

    async fn select_from_pool(
        &self,
        pool_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Selection> {
        let Some(pool) = self.pools.get(pool_id)? else {
            return Ok(Selection::NoEligibleChannel);
        };
        if !pool.active || pool.members.is_empty() {
            return Ok(Selection::NoEligibleChannel);
        }

        // Fallback-only members wait until every regular member is exhausted
        // or unhealthy, regardless of strategy.
        let regular = self.qualify_members(&pool, false, now).await?;
        if let Some(selection) = self.dispatch(&pool, regular, now).await? {
            return Ok(selection);
        }
        let fallback = self.qualify_members(&pool, true, now).await?;
        if let Some(selection) = self.dispatch(&pool, fallback, now).await? {
            return Ok(selection);
        }
        Ok(Selection::NoEligibleChannel)
    }

    /// Apply the pool's strategy to an eligible candidate set
    ///
    /// Returns `None` when the set produced no claimable channel, letting the
    /// caller move on to fallback members.
    async fn dispatch(
        &self,
        pool: &Pool,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Selection>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let ordered = match pool.strategy {
            RotationStrategy::QuotaBased => {
                // Highest remaining first, ties broken by lowest priority
                let mut ordered = candidates;
                ordered.sort_by(|a, b| {
                    b.remaining
                        .cmp(&a.remaining)
                        .then(a.priority.cmp(&b.priority))
                });
                ordered
            }
            RotationStrategy::Priority => {
                let mut ordered = candidates;
                ordered.sort_by_key(|c| c.priority);
                ordered
            }
            RotationStrategy::RoundRobin => {
                // Next eligible member after the persisted cursor, cyclically;
                // the cursor position itself sorts last.
                let len = pool.members.len();
                let start = pool.last_selected_index as usize % len;
                let mut ordered = candidates;
                ordered.sort_by_key(|c| (c.index + len - start - 1) % len);
                ordered
            }
        };

        for candidate in ordered {
            if self.health.begin_attempt(candidate.channel.id, now)? {
                if pool.strategy == RotationStrategy::RoundRobin {
                    // Persist the cursor only after the selection stuck; a
                    // lost race just means another run already advanced it.
                    let moved = self.pools.update_cursor(
                        pool.id,
                        pool.last_selected_index,
                        candidate.index as u32,
                    )?;
                    if !moved {
                        tracing::debug!(pool_id = %pool.id, "round-robin cursor moved concurrently");
                    }
                }
                return Ok(Some(Selection::Selected(candidate.channel)));
            }
        }
        Ok(None)
    }

    /// Eligibility-filter one fallback class of a pool's members
    async fn qualify_members(
        &self,
        pool: &Pool,
        fallback: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for (index, member) in pool.members.iter().enumerate() {
            if member.is_fallback_only != fallback {
                continue;
            }
            let Some(channel) = self.channels.get(member.channel_id)? else {
                continue;
            };
            if let Some(candidate) = self.qualify(&channel, member.priority, index, now).await? {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    /// All eligibility gates for one channel; `None` when any gate fails
    async fn qualify(
        &self,
        channel: &Channel,
        priority: u32,
        index: usize,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Candidate>> {
        if !channel.auth_status.is_usable() {
            return Ok(None);
        }
        if !self.health.is_eligible(channel.id, now)? {
            return Ok(None);
        }
        let remaining = self.quota.remaining_uploads(channel, now).await?;
        if remaining == 0 {
            return Ok(None);
        }
        Ok(Some(Candidate {
            channel: channel.clone(),
            priority,
            index,
            remaining,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::models::{AuthStatus, PoolMember};
    use crate::publish::{PlanInfo, StaticSubscriptions};
    use crate::storage::Store;
    use chrono::Duration;

    struct Fixture {
        store: Store,
        subs: Arc<StaticSubscriptions>,
        quota: Arc<QuotaTracker>,
        health: Arc<HealthMonitor>,
        selector: RotationSelector,
    }

    fn fixture() -> Fixture {
        let store = Store::memory();
        let subs = Arc::new(StaticSubscriptions::new());
        let quota = Arc::new(QuotaTracker::new(store.quota.clone(), subs.clone()));
        let health = Arc::new(HealthMonitor::new(
            store.health.clone(),
            HealthConfig {
                failure_threshold: 5,
                cooldown_secs: 60,
            },
        ));
        let selector = RotationSelector::new(
            store.channels.clone(),
            store.pools.clone(),
            quota.clone(),
            health.clone(),
        );
        Fixture {
            store,
            subs,
            quota,
            health,
            selector,
        }
    }

    impl Fixture {
        /// Connected channel whose owner has the given daily ceiling
        fn channel(&self, name: &str, ceiling: u32) -> Channel {
            let account = Uuid::new_v4();
            self.subs.set(account, PlanInfo::limited(ceiling));
            let mut channel = Channel::new(account, name);
            channel.auth_status = AuthStatus::Connected;
            self.store.channels.insert(&channel).unwrap();
            channel
        }

        fn pool(&self, strategy: RotationStrategy, members: Vec<PoolMember>) -> Pool {
            let mut pool = Pool::new("pool", strategy);
            for member in members {
                pool.add_member(member).unwrap();
            }
            self.store.pools.insert(&pool).unwrap();
            pool
        }
    }

    #[tokio::test]
    async fn test_quota_based_picks_highest_remaining() {
        let f = fixture();
        let now = Utc::now();
        let small = f.channel("small", 2);
        let big = f.channel("big", 10);
        let pool = f.pool(
            RotationStrategy::QuotaBased,
            vec![PoolMember::new(small.id, 1), PoolMember::new(big.id, 2)],
        );

        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        assert_eq!(selection.channel().unwrap().id, big.id);
    }

    #[tokio::test]
    async fn test_quota_based_tie_breaks_by_priority() {
        let f = fixture();
        let now = Utc::now();
        let second = f.channel("second", 5);
        let first = f.channel("first", 5);
        let pool = f.pool(
            RotationStrategy::QuotaBased,
            vec![PoolMember::new(second.id, 2), PoolMember::new(first.id, 1)],
        );

        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        assert_eq!(selection.channel().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_exhausted_pool_returns_no_eligible() {
        // Pool scenario: ceilings 3 and 0; the 3-remaining channel is chosen
        // until its quota drains, then nothing qualifies.
        let f = fixture();
        let now = Utc::now();
        let empty = f.channel("empty", 0);
        let loaded = f.channel("loaded", 3);
        let pool = f.pool(
            RotationStrategy::QuotaBased,
            vec![PoolMember::new(empty.id, 1), PoolMember::new(loaded.id, 2)],
        );

        for _ in 0..3 {
            let selection = f
                .selector
                .select(Destination::Pool(pool.id), now)
                .await
                .unwrap();
            let channel = selection.channel().expect("capacity remains");
            assert_eq!(channel.id, loaded.id);
            f.quota.record_upload(&channel, now).unwrap();
        }

        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        assert!(matches!(selection, Selection::NoEligibleChannel));
    }

    #[tokio::test]
    async fn test_open_circuit_always_skipped() {
        let f = fixture();
        let now = Utc::now();
        let broken = f.channel("broken", 10);
        let healthy = f.channel("healthy", 1);
        let pool = f.pool(
            RotationStrategy::QuotaBased,
            vec![PoolMember::new(broken.id, 1), PoolMember::new(healthy.id, 2)],
        );

        // Five failures open the circuit on the bigger channel
        for _ in 0..5 {
            f.health.record_failure(broken.id, "err", None, now).unwrap();
        }

        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        assert_eq!(selection.channel().unwrap().id, healthy.id);
    }

    #[tokio::test]
    async fn test_half_open_probe_dispensed_once() {
        // Circuit scenario: channel fails until open, cool-down elapses, the
        // next selection dispenses exactly one probe.
        let f = fixture();
        let t0 = Utc::now();
        let only = f.channel("only", 10);
        let pool = f.pool(RotationStrategy::Priority, vec![PoolMember::new(only.id, 1)]);

        for _ in 0..5 {
            f.health.record_failure(only.id, "err", None, t0).unwrap();
        }
        let selection = f.selector.select(Destination::Pool(pool.id), t0).await.unwrap();
        assert!(matches!(selection, Selection::NoEligibleChannel));

        // After cool-down the channel comes back as a single probe
        let t1 = t0 + Duration::seconds(61);
        let selection = f.selector.select(Destination::Pool(pool.id), t1).await.unwrap();
        assert_eq!(selection.channel().unwrap().id, only.id);

        // Probe still unresolved: no second hand-out
        let selection = f.selector.select(Destination::Pool(pool.id), t1).await.unwrap();
        assert!(matches!(selection, Selection::NoEligibleChannel));

        // Probe fails: circuit reopens until the next cool-down
        f.health.record_failure(only.id, "probe", None, t1).unwrap();
        let selection = f.selector.select(Destination::Pool(pool.id), t1).await.unwrap();
        assert!(matches!(selection, Selection::NoEligibleChannel));
    }

    #[tokio::test]
    async fn test_fallback_only_when_regulars_unavailable() {
        let f = fixture();
        let now = Utc::now();
        let regular = f.channel("regular", 1);
        let reserve = f.channel("reserve", 10);
        let pool = f.pool(
            RotationStrategy::Priority,
            vec![
                PoolMember::new(regular.id, 1),
                PoolMember::fallback(reserve.id, 2),
            ],
        );

        // Regular member wins despite the fallback's larger quota
        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        let channel = selection.channel().unwrap();
        assert_eq!(channel.id, regular.id);

        // Drain the regular member; the fallback takes over
        f.quota.record_upload(&channel, now).unwrap();
        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        assert_eq!(selection.channel().unwrap().id, reserve.id);
    }

    #[tokio::test]
    async fn test_round_robin_visits_all_before_repeating() {
        let f = fixture();
        let now = Utc::now();
        let a = f.channel("a", 100);
        let b = f.channel("b", 100);
        let c = f.channel("c", 100);
        let pool = f.pool(
            RotationStrategy::RoundRobin,
            vec![
                PoolMember::new(a.id, 1),
                PoolMember::new(b.id, 2),
                PoolMember::new(c.id, 3),
            ],
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            let selection = f
                .selector
                .select(Destination::Pool(pool.id), now)
                .await
                .unwrap();
            seen.push(selection.channel().unwrap().id);
        }
        // One full cycle touches every member exactly once
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);

        // The next cycle repeats the same order
        for expected in &seen {
            let selection = f
                .selector
                .select(Destination::Pool(pool.id), now)
                .await
                .unwrap();
            assert_eq!(selection.channel().unwrap().id, *expected);
        }
    }

    #[tokio::test]
    async fn test_round_robin_skips_ineligible_members() {
        let f = fixture();
        let now = Utc::now();
        let a = f.channel("a", 100);
        let b = f.channel("b", 100);
        let c = f.channel("c", 100);
        let pool = f.pool(
            RotationStrategy::RoundRobin,
            vec![
                PoolMember::new(a.id, 1),
                PoolMember::new(b.id, 2),
                PoolMember::new(c.id, 3),
            ],
        );

        for _ in 0..5 {
            f.health.record_failure(b.id, "down", None, now).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let selection = f
                .selector
                .select(Destination::Pool(pool.id), now)
                .await
                .unwrap();
            seen.push(selection.channel().unwrap().id);
        }
        assert!(!seen.contains(&b.id));
        // The two eligible members alternate
        assert_ne!(seen[0], seen[1]);
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);
    }

    #[tokio::test]
    async fn test_priority_strategy_prefers_lowest_value() {
        let f = fixture();
        let now = Utc::now();
        let third = f.channel("third", 10);
        let first = f.channel("first", 10);
        let second = f.channel("second", 10);
        let pool = f.pool(
            RotationStrategy::Priority,
            vec![
                PoolMember::new(third.id, 30),
                PoolMember::new(first.id, 10),
                PoolMember::new(second.id, 20),
            ],
        );

        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        assert_eq!(selection.channel().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_single_channel_destination_gated() {
        let f = fixture();
        let now = Utc::now();
        let channel = f.channel("solo", 1);

        let selection = f
            .selector
            .select(Destination::Channel(channel.id), now)
            .await
            .unwrap();
        assert_eq!(selection.channel().unwrap().id, channel.id);

        // Unusable auth is ineligible even with quota remaining
        f.store
            .channels
            .set_auth_status(channel.id, AuthStatus::TokenRevoked)
            .unwrap();
        let selection = f
            .selector
            .select(Destination::Channel(channel.id), now)
            .await
            .unwrap();
        assert!(matches!(selection, Selection::NoEligibleChannel));
    }

    #[tokio::test]
    async fn test_inactive_pool_yields_nothing() {
        let f = fixture();
        let now = Utc::now();
        let channel = f.channel("idle", 5);
        let pool = f.pool(
            RotationStrategy::QuotaBased,
            vec![PoolMember::new(channel.id, 1)],
        );
        f.store.pools.set_active(pool.id, false).unwrap();

        let selection = f.selector.select(Destination::Pool(pool.id), now).await.unwrap();
        assert!(matches!(selection, Selection::NoEligibleChannel));
    }
}
