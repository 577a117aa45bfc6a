//! Publish-time scoring and suggestions
//!
//! Scores candidate posting hours from two inputs: heuristic peak-hour rules
//! and the historical outcome record of past publishes. Suggestions are
//! derived values, recomputed on demand; nothing in this module persists.
//!
//! The score for an (hour, day type) pair is built additively from a base of
//! 50, a historical bonus proportional to the observed success rate, peak and
//! day-of-week bonuses, and a low-engagement penalty for the small hours,
//! clamped to [0, 100].

use chrono::{DateTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Number of suggestions surfaced as recommendations
pub const TOP_SUGGESTIONS: usize = 5;

/// Minimum samples before history is quoted as a reason
const HISTORY_REASON_MIN_SAMPLES: u32 = 3;

/// Minimum success rate before history is quoted as a reason
const HISTORY_REASON_MIN_RATE: f64 = 0.8;

// ============================================================================
// Day Type
// ============================================================================

/// Coarse day classification used for scoring and deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    Weekday,
    Weekend,
}

impl DayType {
    pub fn from_weekday(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Sat | Weekday::Sun => Self::Weekend,
            _ => Self::Weekday,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekday => "weekday",
            Self::Weekend => "weekend",
        }
    }
}

impl fmt::Display for DayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Confidence Tier
// ============================================================================

/// How much weight a suggestion's score carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::High
        } else if score >= 60 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

// ============================================================================
// Outcome History
// ============================================================================

/// One resolved publish outcome, as fed to the scorer
#[derive(Debug, Clone, Copy)]
pub struct OutcomeSample {
    /// When the publish resolved
    pub at: DateTime<Utc>,

    pub success: bool,
}

/// Per-hour aggregation of past outcomes
#[derive(Debug, Clone, Copy, Default)]
pub struct HourBucket {
    pub attempts: u32,
    pub successes: u32,
}

impl HourBucket {
    pub fn success_rate(&self) -> Option<f64> {
        if self.attempts == 0 {
            None
        } else {
            Some(self.successes as f64 / self.attempts as f64)
        }
    }
}

/// Historical outcomes bucketed by hour of day
#[derive(Debug, Clone, Default)]
pub struct OutcomeHistory {
    buckets: [HourBucket; 24],
}

impl OutcomeHistory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bucket samples by their local hour in `tz`
    pub fn from_samples(samples: &[OutcomeSample], tz: Tz) -> Self {
        use chrono::Timelike;

        let mut history = Self::default();
        for sample in samples {
            let hour = sample.at.with_timezone(&tz).hour() as usize;
            history.buckets[hour].attempts += 1;
            if sample.success {
                history.buckets[hour].successes += 1;
            }
        }
        history
    }

    /// Directly seed a bucket, used by tests and the CLI
    pub fn set_bucket(&mut self, hour: u8, attempts: u32, successes: u32) {
        self.buckets[hour as usize] = HourBucket { attempts, successes };
    }

    pub fn bucket(&self, hour: u8) -> HourBucket {
        self.buckets[hour as usize % 24]
    }
}

// ============================================================================
// Score Breakdown
// ============================================================================

/// The additive parts of a score, kept for reason reporting
#[derive(Debug, Clone, Copy)]
pub struct ScoreBreakdown {
    pub hour: u8,
    pub day_type: DayType,

    pub base: i32,
    pub historical: i32,
    pub peak: i32,
    pub day: i32,
    pub penalty: i32,

    /// Whether the historical record is strong enough to quote
    history_quotable: bool,
}

impl ScoreBreakdown {
    /// Final score clamped to [0, 100]
    pub fn total(&self) -> u8 {
        (self.base + self.historical + self.peak + self.day + self.penalty).clamp(0, 100) as u8
    }

    /// Human-readable reason reflecting the dominant contributing factor
    pub fn reason(&self) -> String {
        if self.history_quotable && self.historical >= self.peak {
            return format!(
                "strong historical success rate at {:02}:00",
                self.hour
            );
        }
        match self.peak {
            30 if (12..=15).contains(&self.hour) => "lunch window peak engagement".to_string(),
            30 => "evening window peak engagement".to_string(),
            15 => "general daytime engagement".to_string(),
            _ => {
                if self.penalty < 0 {
                    "low-engagement overnight hours".to_string()
                } else if self.day_type == DayType::Weekend {
                    "weekend audience boost".to_string()
                } else {
                    "steady weekday audience".to_string()
                }
            }
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Score a candidate (hour, day type) pair against historical outcomes
pub fn score_hour(hour: u8, day_type: DayType, history: &OutcomeHistory) -> ScoreBreakdown {
    let hour = hour % 24;
    let bucket = history.bucket(hour);

    let historical = match bucket.success_rate() {
        Some(rate) => (rate * 40.0).round() as i32,
        None => 0,
    };
    let history_quotable = bucket.attempts >= HISTORY_REASON_MIN_SAMPLES
        && bucket.success_rate().unwrap_or(0.0) >= HISTORY_REASON_MIN_RATE;

    let peak = if (12..=15).contains(&hour) || (19..=21).contains(&hour) {
        30
    } else if (9..=22).contains(&hour) {
        15
    } else {
        0
    };

    let day = match day_type {
        DayType::Weekend => 15,
        DayType::Weekday => 10,
    };

    let penalty = if hour <= 6 { -25 } else { 0 };

    ScoreBreakdown {
        hour,
        day_type,
        base: 50,
        historical,
        peak,
        day,
        penalty,
        history_quotable,
    }
}

// ============================================================================
// Time Suggestion
// ============================================================================

/// A ranked posting-time recommendation
///
/// Transient value object; recomputed on demand and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSuggestion {
    /// Hour of day, 0-23
    pub hour: u8,

    pub day_type: DayType,

    /// Score in [0, 100]
    pub score: u8,

    pub confidence: ConfidenceTier,

    /// Dominant contributing factor, human readable
    pub reason: String,
}

/// Rank all (hour, day) candidates and surface the top recommendations
///
/// Candidates for every hour of every weekday are deduplicated by
/// (hour, day type) keeping the higher score, then ranked descending; ties
/// break toward the earlier hour so output is deterministic.
pub fn suggest_times(history: &OutcomeHistory) -> Vec<TimeSuggestion> {
    let weekdays = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    let mut best: HashMap<(u8, DayType), ScoreBreakdown> = HashMap::new();
    for weekday in weekdays {
        let day_type = DayType::from_weekday(weekday);
        for hour in 0..24u8 {
            let breakdown = score_hour(hour, day_type, history);
            best.entry((hour, day_type))
                .and_modify(|existing| {
                    if breakdown.total() > existing.total() {
                        *existing = breakdown;
                    }
                })
                .or_insert(breakdown);
        }
    }

    let mut ranked: Vec<ScoreBreakdown> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.total()
            .cmp(&a.total())
            .then(a.hour.cmp(&b.hour))
            .then(a.day_type.as_str().cmp(b.day_type.as_str()))
    });

    ranked
        .into_iter()
        .take(TOP_SUGGESTIONS)
        .map(|breakdown| TimeSuggestion {
            hour: breakdown.hour,
            day_type: breakdown.day_type,
            score: breakdown.total(),
            confidence: ConfidenceTier::from_score(breakdown.total()),
            reason: breakdown.reason(),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_type_classification() {
        assert_eq!(DayType::from_weekday(Weekday::Mon), DayType::Weekday);
        assert_eq!(DayType::from_weekday(Weekday::Fri), DayType::Weekday);
        assert_eq!(DayType::from_weekday(Weekday::Sat), DayType::Weekend);
        assert_eq!(DayType::from_weekday(Weekday::Sun), DayType::Weekend);
    }

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(ConfidenceTier::from_score(80), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(79), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(60), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(59), ConfidenceTier::Low);
    }

    #[test]
    fn test_overnight_never_beats_evening_peak() {
        // Property from the design: hour 2 (penalized) is never above hour 20
        // (evening peak), all other factors held equal.
        for day_type in [DayType::Weekday, DayType::Weekend] {
            let history = OutcomeHistory::empty();
            let night = score_hour(2, day_type, &history);
            let evening = score_hour(20, day_type, &history);
            assert!(night.total() <= evening.total());

            // Even a perfect history at 02:00 cannot close the 55-point gap
            // when 20:00 carries the same record.
            let mut seeded = OutcomeHistory::empty();
            seeded.set_bucket(2, 10, 10);
            seeded.set_bucket(20, 10, 10);
            let night = score_hour(2, day_type, &seeded);
            let evening = score_hour(20, day_type, &seeded);
            assert!(night.total() <= evening.total());
        }
    }

    #[test]
    fn test_score_components() {
        let history = OutcomeHistory::empty();

        // Evening weekday, no history: 50 + 30 + 10 = 90
        assert_eq!(score_hour(20, DayType::Weekday, &history).total(), 90);
        // Lunch weekend: 50 + 30 + 15 = 95
        assert_eq!(score_hour(13, DayType::Weekend, &history).total(), 95);
        // Mid-morning weekday: 50 + 15 + 10 = 75
        assert_eq!(score_hour(10, DayType::Weekday, &history).total(), 75);
        // 03:00 weekday: 50 + 0 + 10 - 25 = 35
        assert_eq!(score_hour(3, DayType::Weekday, &history).total(), 35);
        // 23:00 sits outside both the peak and daytime windows: 50 + 10 = 60
        assert_eq!(score_hour(23, DayType::Weekday, &history).total(), 60);
    }

    #[test]
    fn test_historical_bonus_scales_with_rate() {
        let mut history = OutcomeHistory::empty();
        history.set_bucket(10, 10, 5);

        // 50 base + 20 historical + 15 daytime + 10 weekday = 95
        assert_eq!(score_hour(10, DayType::Weekday, &history).total(), 95);

        history.set_bucket(10, 10, 10);
        // Full 40-point bonus clamps at 100
        assert_eq!(score_hour(10, DayType::Weekday, &history).total(), 100);
    }

    #[test]
    fn test_score_clamped() {
        let mut history = OutcomeHistory::empty();
        history.set_bucket(13, 100, 100);
        let score = score_hour(13, DayType::Weekend, &history).total();
        assert!(score <= 100);

        history.set_bucket(0, 100, 0);
        let low = score_hour(0, DayType::Weekday, &history).total();
        assert!(low <= 100);
    }

    #[test]
    fn test_history_reason_gated() {
        // High rate but only 2 samples: history must not be quoted
        let mut history = OutcomeHistory::empty();
        history.set_bucket(20, 2, 2);
        let reason = score_hour(20, DayType::Weekday, &history).reason();
        assert!(!reason.contains("historical"));

        // 3 samples at 100% qualifies
        history.set_bucket(20, 3, 3);
        let reason = score_hour(20, DayType::Weekday, &history).reason();
        assert!(reason.contains("historical"));

        // 10 samples at 70% stays below the rate gate
        history.set_bucket(20, 10, 7);
        let reason = score_hour(20, DayType::Weekday, &history).reason();
        assert!(!reason.contains("historical"));
    }

    #[test]
    fn test_suggestions_top_five_ranked() {
        let history = OutcomeHistory::empty();
        let suggestions = suggest_times(&history);

        assert_eq!(suggestions.len(), TOP_SUGGESTIONS);
        for pair in suggestions.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // With no history, weekend peak hours dominate
        assert_eq!(suggestions[0].day_type, DayType::Weekend);
        assert_eq!(suggestions[0].hour, 12);
        assert_eq!(suggestions[0].score, 95);
    }

    #[test]
    fn test_suggestions_deduplicated() {
        let history = OutcomeHistory::empty();
        let suggestions = suggest_times(&history);

        let mut keys: Vec<(u8, DayType)> =
            suggestions.iter().map(|s| (s.hour, s.day_type)).collect();
        keys.sort_by_key(|(h, d)| (*h, d.as_str()));
        keys.dedup();
        assert_eq!(keys.len(), suggestions.len());
    }

    #[test]
    fn test_history_bucketing_uses_timezone() {
        // 2024-01-15 23:30 UTC is 08:30 on the 16th in Tokyo
        let at = DateTime::parse_from_rfc3339("2024-01-15T23:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let samples = [OutcomeSample { at, success: true }];

        let utc_history = OutcomeHistory::from_samples(&samples, chrono_tz::UTC);
        assert_eq!(utc_history.bucket(23).attempts, 1);
        assert_eq!(utc_history.bucket(8).attempts, 0);

        let tokyo_history = OutcomeHistory::from_samples(&samples, chrono_tz::Asia::Tokyo);
        assert_eq!(tokyo_history.bucket(8).attempts, 1);
        assert_eq!(tokyo_history.bucket(23).attempts, 0);
    }
}
