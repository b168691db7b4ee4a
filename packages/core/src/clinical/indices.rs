//! Derived clinical indices.
//!
//! Every value here is a pure function of raw exam/patient fields and is
//! rounded through [`round2`], the single rounding helper shared with the
//! comparison engine. Historical reports depend on these numbers being
//! reproducible, so do not round anywhere else.

/// Round to 2 decimal places: scale by 100, round half away from zero,
/// scale back.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Body-mass (adiposity) index: `weight / height_m²`.
///
/// Returns `None` when either input is missing or the height is not
/// positive.
pub fn adiposity_index(weight_kg: Option<f64>, height_cm: Option<f64>) -> Option<f64> {
    let weight = weight_kg?;
    let height = height_cm?;
    if height <= 0.0 {
        return None;
    }
    let height_m = height / 100.0;
    Some(round2(weight / (height_m * height_m)))
}

/// Weighted snoring score over the low/medium/high intensity bands.
///
/// Missing bands count as zero. With all three at zero the score is
/// undefined and `None` is returned.
pub fn snoring_score(low_pct: Option<f64>, medium_pct: Option<f64>, high_pct: Option<f64>) -> Option<f64> {
    let low = low_pct.unwrap_or(0.0);
    let medium = medium_pct.unwrap_or(0.0);
    let high = high_pct.unwrap_or(0.0);

    if low == 0.0 && medium == 0.0 && high == 0.0 {
        return None;
    }

    Some(round2((low + medium * 2.0 + high * 3.0) / 3.0))
}

/// Therapy adherence as a percentage of prescribed sessions.
///
/// Values above 100 are kept: over-usage is a signal, not an error.
pub fn adherence_percentage(sessions_used: Option<i64>, sessions_total: Option<i64>) -> Option<f64> {
    let used = sessions_used.unwrap_or(0);
    let total = sessions_total?;
    if total <= 0 {
        return None;
    }
    Some(round2(used as f64 / total as f64 * 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ---- round2 ----

    #[test]
    fn round2_rounds_half_away_from_zero() {
        assert_eq!(round2(2.345_000_1), 2.35);
        assert_eq!(round2(-2.345_000_1), -2.35);
        assert_eq!(round2(33.333_333), 33.33);
    }

    // ---- adiposity_index ----

    #[test]
    fn adiposity_index_matches_reference_value() {
        assert_eq!(adiposity_index(Some(70.0), Some(175.0)), Some(22.86));
    }

    #[test]
    fn adiposity_index_fails_closed() {
        assert_eq!(adiposity_index(Some(70.0), Some(0.0)), None);
        assert_eq!(adiposity_index(Some(70.0), Some(-170.0)), None);
        assert_eq!(adiposity_index(None, Some(175.0)), None);
        assert_eq!(adiposity_index(Some(70.0), None), None);
    }

    // ---- snoring_score ----

    #[test]
    fn snoring_score_is_undefined_without_any_snoring() {
        assert_eq!(snoring_score(Some(0.0), Some(0.0), Some(0.0)), None);
        assert_eq!(snoring_score(None, None, None), None);
    }

    #[test]
    fn snoring_score_weights_bands() {
        assert_eq!(snoring_score(Some(100.0), Some(0.0), Some(0.0)), Some(33.33));
        assert_eq!(snoring_score(Some(0.0), Some(0.0), Some(100.0)), Some(100.0));
        assert_eq!(snoring_score(Some(30.0), None, Some(10.0)), Some(20.0));
    }

    // ---- adherence_percentage ----

    #[test]
    fn adherence_allows_over_usage() {
        assert_eq!(adherence_percentage(Some(15), Some(10)), Some(150.0));
    }

    #[test]
    fn adherence_treats_missing_usage_as_zero() {
        assert_eq!(adherence_percentage(None, Some(10)), Some(0.0));
    }

    #[test]
    fn adherence_requires_positive_total() {
        assert_eq!(adherence_percentage(Some(5), Some(0)), None);
        assert_eq!(adherence_percentage(Some(5), None), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_adiposity_decreases_with_height(
            weight in 20.0f64..250.0,
            height in 100.0f64..220.0,
            step in 0.5f64..30.0,
        ) {
            let shorter = adiposity_index(Some(weight), Some(height)).unwrap();
            let taller = adiposity_index(Some(weight), Some(height + step)).unwrap();
            prop_assert!(taller <= shorter);
        }

        #[test]
        fn prop_adiposity_increases_with_weight(
            weight in 20.0f64..250.0,
            height in 100.0f64..220.0,
            step in 0.5f64..30.0,
        ) {
            let lighter = adiposity_index(Some(weight), Some(height)).unwrap();
            let heavier = adiposity_index(Some(weight + step), Some(height)).unwrap();
            prop_assert!(heavier >= lighter);
        }

        #[test]
        fn prop_adiposity_matches_reference_within_rounding(
            weight in 20.0f64..250.0,
            height in 100.0f64..220.0,
        ) {
            let reference = weight / ((height / 100.0) * (height / 100.0));
            let value = adiposity_index(Some(weight), Some(height)).unwrap();
            prop_assert!((value - reference).abs() <= 0.005 + 1e-9);
        }
    }
}
