//! Daily upload quota tracking
//!
//! Each channel's ceiling comes from its owner's subscription plan; usage is
//! counted per local calendar day in the owner's configured timezone, so the
//! window resets at that zone's midnight rather than at UTC midnight. A
//! channel without an active subscription contributes no capacity; unlimited
//! plans are unbounded.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::models::Channel;
use crate::publish::SubscriptionLookup;
use crate::storage::repository::QuotaRepository;

// ============================================================================
// Quota
// ============================================================================

/// A channel's daily upload ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    Limited(u32),
    Unlimited,
}

impl Quota {
    /// Remaining capacity given today's usage
    pub fn remaining(&self, used: u32) -> u32 {
        match self {
            Self::Limited(ceiling) => ceiling.saturating_sub(used),
            Self::Unlimited => u32::MAX,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

// ============================================================================
// Quota Tracker
// ============================================================================

/// Computes remaining capacity and records usage for channels
pub struct QuotaTracker {
    usage: Arc<dyn QuotaRepository>,
    subscriptions: Arc<dyn SubscriptionLookup>,
}

impl QuotaTracker {
    pub fn new(usage: Arc<dyn QuotaRepository>, subscriptions: Arc<dyn SubscriptionLookup>) -> Self {
        Self {
            usage,
            subscriptions,
        }
    }

    /// Ceiling from the owning subscription's plan
    ///
    /// No subscription or an expired one yields zero; a plan without a
    /// configured ceiling is unbounded (administrative accounts).
    pub async fn daily_ceiling(&self, channel: &Channel) -> anyhow::Result<Quota> {
        match self.subscriptions.plan_for(channel.account_id).await? {
            None => Ok(Quota::Limited(0)),
            Some(plan) if !plan.active => Ok(Quota::Limited(0)),
            Some(plan) => Ok(match plan.daily_upload_ceiling {
                Some(ceiling) => Quota::Limited(ceiling),
                None => Quota::Unlimited,
            }),
        }
    }

    /// Uploads the channel can still take in its current local day
    pub async fn remaining_uploads(
        &self,
        channel: &Channel,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u32> {
        let ceiling = self.daily_ceiling(channel).await?;
        if ceiling.is_unlimited() {
            return Ok(u32::MAX);
        }
        let used = self.usage.usage(channel.id, channel.local_date(now))?;
        Ok(ceiling.remaining(used))
    }

    /// Count one upload against the channel's current local day
    pub fn record_upload(&self, channel: &Channel, now: DateTime<Utc>) -> anyhow::Result<u32> {
        Ok(self
            .usage
            .increment_usage(channel.id, channel.local_date(now))?)
    }
}

// ============================================================================
// Tests
// ============================================================================
