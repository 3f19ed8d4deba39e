//! Median and Median-Absolute-Deviation outlier classification. Pure,
//! synchronous, `std`-only — shared by the node's own pre-submission
//! sanity check and mirrored conceptually by the on-chain slashing
//! rule (which uses a plain percentage bound, not MAD; see Open
//! Question 2 in DESIGN.md).

/// Median of `n` even and odd-length samples: the middle element for
/// odd `n`, the mean of the two middle elements (rounded toward
/// negative infinity for integer division, ties broken toward the
/// lower value) for even `n`. Returns `None` for an
/// empty sample.
pub fn median(values: &[i128]) -> Option<i128> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    Some(if n % 2 == 1 {
        sorted[n / 2]
    } else {
        let lo = sorted[n / 2 - 1];
        let hi = sorted[n / 2];
        // lo + (hi - lo) / 2 avoids overflow when lo + hi would not fit.
        lo + (hi - lo) / 2
    })
}

/// Median absolute deviation: `median(|x_i - median(x)|)`.
pub fn mad(values: &[i128]) -> Option<i128> {
    let m = median(values)?;
    let deviations: Vec<i128> = values.iter().map(|&x| (x - m).abs()).collect();
    median(&deviations)
}

/// Classifies each value as an outlier (`true`) or not, given a
/// multiplier `k` (default 3.0, expressed here as a rational
/// `k_num/k_den` to stay in integer arithmetic). If `MAD == 0`,
/// any value that differs from the median at all is an outlier.
///
/// Returns `None` if `values` is empty.
pub fn classify_outliers(values: &[i128], k_num: i128, k_den: i128) -> Option<Vec<bool>> {
    let m = median(values)?;
    let d: Vec<i128> = values.iter().map(|&x| (x - m).abs()).collect();
    let mad_v = median(&d)?;

    Some(
        values
            .iter()
            .map(|&x| {
                let dev = (x - m).abs();
                if mad_v == 0 {
                    dev != 0
                } else {
                    // dev > k * mad  <=>  dev * k_den > k_num * mad
                    dev.saturating_mul(k_den) > k_num.saturating_mul(mad_v)
                }
            })
            .collect(),
    )
}

/// Convenience: default `k = 3.0` classification.
pub fn classify_outliers_default(values: &[i128]) -> Option<Vec<bool>> {
    classify_outliers(values, 3, 1)
}

/// Filters outliers (per `classify_outliers`) and returns the median of
/// the surviving sample, or `None` if every value was classified an
/// outlier (the caller should reject the job in that case).
pub fn median_of_survivors(values: &[i128], k_num: i128, k_den: i128) -> Option<i128> {
    let flags = classify_outliers(values, k_num, k_den)?;
    let survivors: Vec<i128> = values
        .iter()
        .zip(flags.iter())
        .filter(|(_, &is_outlier)| !is_outlier)
        .map(|(&v, _)| v)
        .collect();
    median(&survivors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_odd() {
        assert_eq!(median(&[3, 1, 2]), Some(2));
    }

    #[test]
    fn median_even_rounds_down() {
        // (3 + 4) / 2 = 3 (integer division, toward the lower).
        assert_eq!(median(&[1, 3, 4, 9]), Some(3));
    }

    #[test]
    fn median_empty_is_none() {
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn median_within_bounds() {
        let xs = [5, 1, 9, 3, 7];
        let m = median(&xs).unwrap();
        assert!(m >= *xs.iter().min().unwrap());
        assert!(m <= *xs.iter().max().unwrap());
    }

    #[test]
    fn median_equivariant_under_scaling() {
        let xs = [5, 1, 9, 3, 7];
        let scaled: Vec<i128> = xs.iter().map(|x| x * 10).collect();
        assert_eq!(median(&scaled), median(&xs).map(|m| m * 10));
    }

    #[test]
    fn mad_all_equal_is_zero() {
        assert_eq!(mad(&[5, 5, 5]), Some(0));
    }

    #[test]
    fn outliers_none_when_all_equal() {
        let flags = classify_outliers_default(&[100, 100, 100]).unwrap();
        assert!(flags.iter().all(|&f| !f));
    }

    #[test]
    fn outliers_flags_single_deviant() {
        // 384752000000, 384810000000, 999999999999 — the third is wildly off.
        let xs = [384752000000i128, 384810000000, 999999999999];
        let flags = classify_outliers_default(&xs).unwrap();
        assert_eq!(flags, vec![false, false, true]);
    }

    #[test]
    fn survivors_median_matches_scenario_b() {
        let xs = [384752000000i128, 384810000000, 999999999999];
        let value = median_of_survivors(&xs, 3, 1).unwrap();
        assert_eq!(value, 384781000000);
    }

    #[test]
    fn all_outliers_when_mad_zero_and_values_differ() {
        // Two equal, one different: median is the repeated value, MAD=0,
        // so the odd one out is flagged but the pair is not.
        let xs = [10i128, 10, 20];
        let flags = classify_outliers_default(&xs).unwrap();
        assert_eq!(flags, vec![false, false, true]);
    }
}
