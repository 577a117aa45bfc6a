//! Property tests for the pure scoring components

use proptest::prelude::*;
use uuid::Uuid;

use clipcast::abtest::{AbTest, Variant, MIN_SAMPLE_SIZE};
use clipcast::timing::{score_hour, DayType, OutcomeHistory};

fn test_with_counts(ups_a: u64, succ_a: u64, ups_b: u64, succ_b: u64) -> AbTest {
    let mut test = AbTest::new(
        Uuid::new_v4(),
        Variant::new("a", vec![]),
        Variant::new("b", vec![]),
    );
    test.variant_a.uploads = ups_a;
    test.variant_a.successes = succ_a;
    test.variant_b.uploads = ups_b;
    test.variant_b.successes = succ_b;
    test
}

proptest! {
    #[test]
    fn score_stays_in_range(
        hour in 0u8..24,
        weekend in any::<bool>(),
        attempts in 0u32..200,
        success_ratio in 0.0f64..=1.0,
    ) {
        let day = if weekend { DayType::Weekend } else { DayType::Weekday };
        let mut history = OutcomeHistory::empty();
        let successes = (attempts as f64 * success_ratio) as u32;
        history.set_bucket(hour, attempts, successes);

        let score = score_hour(hour, day, &history).total();
        prop_assert!(score <= 100);
    }

    #[test]
    fn overnight_never_beats_evening_peak(
        weekend in any::<bool>(),
        attempts in 0u32..50,
        successes_ratio in 0.0f64..=1.0,
    ) {
        // Identical history at both hours; the low-engagement penalty plus
        // the missing peak bonus must keep 02:00 at or below 20:00.
        let day = if weekend { DayType::Weekend } else { DayType::Weekday };
        let successes = (attempts as f64 * successes_ratio) as u32;
        let mut history = OutcomeHistory::empty();
        history.set_bucket(2, attempts, successes);
        history.set_bucket(20, attempts, successes);

        let night = score_hour(2, day, &history).total();
        let evening = score_hour(20, day, &history).total();
        prop_assert!(night <= evening);
    }

    #[test]
    fn more_history_success_never_lowers_score(
        hour in 0u8..24,
        attempts in 1u32..100,
        successes in 0u32..100,
    ) {
        let successes = successes.min(attempts);
        let mut less = OutcomeHistory::empty();
        less.set_bucket(hour, attempts, successes.saturating_sub(1));
        let mut more = OutcomeHistory::empty();
        more.set_bucket(hour, attempts, successes);

        let low = score_hour(hour, DayType::Weekday, &less).total();
        let high = score_hour(hour, DayType::Weekday, &more).total();
        prop_assert!(low <= high);
    }

    #[test]
    fn alternation_keeps_arms_within_one(total in 0u64..400) {
        let mut test = test_with_counts(0, 0, 0, 0);
        for _ in 0..total {
            test.assign_upload().unwrap();
        }
        let diff = test.variant_a.uploads.abs_diff(test.variant_b.uploads);
        prop_assert!(diff <= 1);
    }

    #[test]
    fn confidence_gated_below_min_sample(
        ups_a in 0u64..MIN_SAMPLE_SIZE,
        succ_ratio in 0.0f64..=1.0,
    ) {
        let ups_b = MIN_SAMPLE_SIZE - 1 - ups_a.min(MIN_SAMPLE_SIZE - 1);
        let succ_a = (ups_a as f64 * succ_ratio) as u64;
        let test = test_with_counts(ups_a, succ_a, ups_b, ups_b / 2);
        prop_assert!(test.confidence().is_none());
    }

    #[test]
    fn confidence_monotonic_in_rate_gap(
        n in 10u64..200,
        base in 0u64..10,
        extra_small in 0u64..50,
        extra_gap in 0u64..50,
    ) {
        // Same sample size, wider success gap never lowers confidence
        let base = base.min(n);
        let small = (base + extra_small).min(n);
        let large = (small + extra_gap).min(n);

        let narrow = test_with_counts(n, small, n, base);
        let wide = test_with_counts(n, large, n, base);
        let (Some(c_narrow), Some(c_wide)) = (narrow.confidence(), wide.confidence()) else {
            return Ok(());
        };
        prop_assert!(c_wide >= c_narrow - 1e-9);
    }

    #[test]
    fn confidence_bounded(
        ups_a in 10u64..500,
        ups_b in 10u64..500,
        succ_a in 0u64..500,
        succ_b in 0u64..500,
    ) {
        let test = test_with_counts(ups_a, succ_a.min(ups_a), ups_b, succ_b.min(ups_b));
        if let Some(confidence) = test.confidence() {
            prop_assert!((0.0..=100.0).contains(&confidence));
        }
    }
}
