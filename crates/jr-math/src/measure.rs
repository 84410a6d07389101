//! Sentinel-aware reductions over numeric samples.

use std::fmt::Debug;

/// DCGM reports blank 32-bit integer fields as values at or above this.
pub const INT32_BLANK: i32 = 0x7fff_fff0;

/// DCGM reports blank 64-bit integer fields as values at or above this.
pub const INT64_BLANK: i64 = 0x7fff_ffff_ffff_fff0;

/// A numeric element that may carry a "measurement unavailable" marker.
pub trait Measure: Copy + PartialOrd + Debug {
    /// Canonical marker for an unavailable measurement.
    const SENTINEL: Self;

    /// Whether this value marks an unavailable measurement.
    fn is_sentinel(self) -> bool;

    /// Sum of the valid values, or `SENTINEL` when there are none.
    fn total(values: &[Self]) -> Self;

    /// Mean of the valid values, or `SENTINEL` when there are none.
    fn mean(values: &[Self]) -> Self;
}

impl Measure for f64 {
    const SENTINEL: Self = f64::NAN;

    fn is_sentinel(self) -> bool {
        self.is_nan()
    }

    fn total(values: &[Self]) -> Self {
        let (acc, n) = values
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(acc, n), v| (acc + v, n + 1));
        if n == 0 {
            f64::NAN
        } else {
            acc
        }
    }

    fn mean(values: &[Self]) -> Self {
        let (acc, n) = values
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(acc, n), v| (acc + v, n + 1));
        if n == 0 {
            f64::NAN
        } else {
            acc / n as f64
        }
    }
}

// Integers accumulate in i128 so sums of microsecond timestamps stay exact.
// A result that does not fit back into the element type is reported as unknown.
macro_rules! integer_measure {
    ($ty:ty, $blank:expr) => {
        impl Measure for $ty {
            const SENTINEL: Self = $blank;

            fn is_sentinel(self) -> bool {
                self >= $blank
            }

            fn total(values: &[Self]) -> Self {
                match integer_sum(values) {
                    Some((acc, _)) => narrow(acc),
                    None => Self::SENTINEL,
                }
            }

            fn mean(values: &[Self]) -> Self {
                match integer_sum(values) {
                    Some((acc, n)) => narrow(acc / n as i128),
                    None => Self::SENTINEL,
                }
            }
        }
    };
}

integer_measure!(i32, INT32_BLANK);
integer_measure!(i64, INT64_BLANK);
integer_measure!(u32, u32::MAX);

fn integer_sum<T>(values: &[T]) -> Option<(i128, usize)>
where
    T: Measure,
    i128: From<T>,
{
    let mut acc: i128 = 0;
    let mut n = 0usize;
    for &v in values {
        if !v.is_sentinel() {
            acc += i128::from(v);
            n += 1;
        }
    }
    (n > 0).then_some((acc, n))
}

fn narrow<T>(acc: i128) -> T
where
    T: Measure + TryFrom<i128>,
{
    T::try_from(acc)
        .ok()
        .filter(|v| !v.is_sentinel())
        .unwrap_or(T::SENTINEL)
}

/// Sum of the valid values; `SENTINEL` if none are valid.
pub fn sum<T: Measure>(values: &[T]) -> T {
    T::total(values)
}

/// Mean of the valid values; `SENTINEL` if none are valid.
pub fn mean<T: Measure>(values: &[T]) -> T {
    T::mean(values)
}

/// Smallest valid value.
///
/// Returns `None` only for an empty slice; a slice holding nothing but
/// sentinels yields `Some(SENTINEL)`.
pub fn min<T: Measure>(values: &[T]) -> Option<T> {
    extreme(values, |candidate, best| candidate < best)
}

/// Largest valid value. Same empty/sentinel rules as [`min`].
pub fn max<T: Measure>(values: &[T]) -> Option<T> {
    extreme(values, |candidate, best| candidate > best)
}

fn extreme<T: Measure>(values: &[T], better: impl Fn(T, T) -> bool) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let best = values
        .iter()
        .copied()
        .filter(|v| !v.is_sentinel())
        .reduce(|best, v| if better(v, best) { v } else { best });
    Some(best.unwrap_or(T::SENTINEL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_float_mean_skips_nan() {
        let v = [100.0, f64::NAN, 200.0];
        assert_eq!(mean(&v), 150.0);
        assert_eq!(sum(&v), 300.0);
    }

    #[test]
    fn test_all_sentinel_propagates() {
        assert!(mean(&[f64::NAN, f64::NAN]).is_nan());
        assert!(sum(&[f64::NAN]).is_nan());
        assert_eq!(mean(&[INT32_BLANK, INT32_BLANK]), INT32_BLANK);
        assert_eq!(sum(&[INT64_BLANK]), INT64_BLANK);
    }

    #[test]
    fn test_empty_is_unknown() {
        let empty: [f64; 0] = [];
        assert!(mean(&empty).is_nan());
        assert_eq!(min(&empty), None);
        assert_eq!(max::<i32>(&[]), None);
    }

    #[test]
    fn test_single_valid_among_sentinels() {
        assert_eq!(mean(&[f64::NAN, 42.5, f64::NAN, f64::NAN]), 42.5);
        assert_eq!(mean(&[INT32_BLANK, 17, INT32_BLANK + 3]), 17);
    }

    #[test]
    fn test_integer_mean_truncates() {
        assert_eq!(mean(&[1i32, 2]), 1);
        assert_eq!(mean(&[-1i32, -2]), -1);
    }

    #[test]
    fn test_timestamp_mean_exact() {
        let start = 1_717_000_000_000_000i64;
        let v = [start, start + 2, start + 4];
        assert_eq!(mean(&v), start + 2);
    }

    #[test]
    fn test_min_max_skip_sentinels() {
        let v = [f64::NAN, 3.0, 1.0, f64::NAN, 2.0];
        assert_eq!(min(&v), Some(1.0));
        assert_eq!(max(&v), Some(3.0));
        assert_eq!(max(&[INT32_BLANK, 80, 90]), Some(90));
    }

    #[test]
    fn test_min_all_sentinel() {
        let v = min(&[f64::NAN, f64::NAN]).unwrap();
        assert!(v.is_nan());
        assert_eq!(max(&[u32::MAX]), Some(u32::MAX));
    }

    #[test]
    fn test_overflow_is_unknown() {
        let big = [0x4000_0000i32, 0x4000_0000];
        assert_eq!(sum(&big), INT32_BLANK);
    }

    proptest! {
        #[test]
        fn mean_is_bounded_by_min_and_max(values in proptest::collection::vec(0i32..=100, 1..64)) {
            let m = mean(&values);
            prop_assert!(m >= min(&values).unwrap());
            prop_assert!(m <= max(&values).unwrap());
        }

        #[test]
        fn sentinels_do_not_shift_the_mean(
            values in proptest::collection::vec(0.0f64..1000.0, 1..32),
            blanks in 0usize..8,
        ) {
            let mut padded = values.clone();
            padded.extend(std::iter::repeat(f64::NAN).take(blanks));
            let a = mean(&values);
            let b = mean(&padded);
            prop_assert!((a - b).abs() < 1e-9);
        }
    }
}
