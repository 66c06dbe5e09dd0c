//! Window statistics over binary64 series. Inputs are never reordered in place
//! except where a function says it takes a sorted slice.

/// `c`-quantile of an ascending slice, linearly interpolated between the
/// adjacent order statistics at rank `(n - 1) * c`.
pub fn quantile_sorted(sorted: &[f64], c: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * c;
            let lo = h.floor() as usize;
            let hi = h.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
            }
        }
    }
}

/// Mean of the `max(1, floor((1 - c) * n))` largest values of an ascending
/// slice of losses.
pub fn tail_mean_sorted(sorted: &[f64], c: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let k = (((1.0 - c) * n as f64).floor() as usize).clamp(1, n);
    let tail = &sorted[n - k..];
    tail.iter().sum::<f64>() / k as f64
}

/// Largest `peak - trough` with the peak preceding the trough. Zero for a
/// non-decreasing series.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut max_dd = 0.0_f64;
    for &v in values {
        if v > peak {
            peak = v;
        }
        let dd = peak - v;
        if dd > max_dd {
            max_dd = dd;
        }
    }
    max_dd
}

/// Sample standard deviation (n - 1 denominator); `NaN` below two points.
pub fn sample_std(xs: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean = xs.iter().sum::<f64>() / n as f64;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Fraction of returns strictly below `-sigmas * std`. Zero when the series
/// has no dispersion.
pub fn tail_probability(returns: &[f64], std: f64, sigmas: f64) -> f64 {
    if returns.is_empty() || std.is_nan() {
        return f64::NAN;
    }
    if std == 0.0 {
        return 0.0;
    }
    let threshold = -sigmas * std;
    let below = returns.iter().filter(|&&r| r < threshold).count();
    below as f64 / returns.len() as f64
}

/// Maps `-0.0` to `0.0` so zero risk never serializes with a sign.
pub fn unsigned_zero(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_interpolates_between_order_statistics() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_sorted(&xs, 0.0), 1.0);
        assert_eq!(quantile_sorted(&xs, 1.0), 5.0);
        assert_eq!(quantile_sorted(&xs, 0.5), 3.0);
        // rank 4 * 0.95 = 3.8
        assert!((quantile_sorted(&xs, 0.95) - 4.8).abs() < 1e-12);
        assert!(quantile_sorted(&[], 0.95).is_nan());
    }

    #[test]
    fn tail_mean_takes_at_least_one_observation() {
        let xs: Vec<f64> = (1..=10).map(f64::from).collect();
        // floor(0.05 * 10) = 0 -> one observation
        assert_eq!(tail_mean_sorted(&xs, 0.95), 10.0);
        // floor(0.2 * 10) = 2
        assert_eq!(tail_mean_sorted(&xs, 0.8), 9.5);
    }

    #[test]
    fn drawdown_requires_peak_before_trough() {
        assert_eq!(max_drawdown(&[100.0, 110.0, 99.0, 105.0]), 11.0);
        // Trough before the peak does not count
        assert_eq!(max_drawdown(&[90.0, 100.0, 120.0]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn std_and_tail() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let s = sample_std(&xs);
        assert!((s - 2.138_089_935).abs() < 1e-6);
        assert!(sample_std(&[1.0]).is_nan());

        assert_eq!(tail_probability(&[0.0, 0.0], 0.0, 3.0), 0.0);
        let mut returns = vec![0.0; 99];
        returns.push(-100.0);
        let s = sample_std(&returns);
        assert_eq!(tail_probability(&returns, s, 3.0), 0.01);
    }

    #[test]
    fn negative_zero_is_normalized() {
        let z = unsigned_zero(-0.0);
        assert!(z.is_sign_positive());
        assert_eq!(unsigned_zero(-1.5), -1.5);
    }
}
