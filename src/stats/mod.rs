//! Outlier-resistant estimators used by the measurement phases


use crate::models::metrics::StabilityMetrics;
use std::time::Duration;

/// Number of samples (or successive differences) at which the single
/// minimum and maximum are dropped before averaging
pub const TRIM_THRESHOLD: usize = 4;

/// Arithmetic mean; `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Mean after dropping one minimum and one maximum when at least
/// [`TRIM_THRESHOLD`] values are present
pub fn trimmed_mean(values: &[f64]) -> Option<f64> {
    if values.len() < TRIM_THRESHOLD {
        return mean(values);
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    mean(&sorted[1..sorted.len() - 1])
}

/// Mean absolute successive difference, trimmed like [`trimmed_mean`].
/// `None` when fewer than two samples exist.
pub fn jitter(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }

    let diffs: Vec<f64> = values.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    trimmed_mean(&diffs)
}

/// Population variance
pub fn variance(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    Some(values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64)
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    variance(values).map(f64::sqrt)
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Bits per second in megabits: `bytes * 8 / seconds / 1e6`
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

/// Stability of a rate series: variance plus a 0..=100 score derived from the
/// coefficient of variation. Needs at least two samples with a positive mean.
pub fn stability(rates: &[f64]) -> Option<StabilityMetrics> {
    if rates.len() < 2 {
        return None;
    }

    let mean = mean(rates)?;
    if mean <= 0.0 {
        return None;
    }

    let variance = variance(rates)?;
    let cv = variance.sqrt() / mean;
    Some(StabilityMetrics {
        score: round_to((100.0 * (1.0 - cv)).clamp(0.0, 100.0), 1),
        variance: round_to(variance, 2),
        sample_count: rates.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[4.0]), Some(4.0));
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
    }

    #[test]
    fn test_trimmed_mean_below_threshold_keeps_all() {
        assert_eq!(trimmed_mean(&[10.0, 20.0, 90.0]), Some(40.0));
    }

    #[test]
    fn test_trimmed_mean_drops_single_outliers() {
        // 1000 and 1 are dropped
        assert_eq!(trimmed_mean(&[10.0, 1000.0, 12.0, 1.0, 14.0]), Some(12.0));
        assert_eq!(trimmed_mean(&[5.0, 5.0, 5.0, 5.0]), Some(5.0));
    }

    #[test]
    fn test_jitter() {
        assert_eq!(jitter(&[]), None);
        assert_eq!(jitter(&[12.0]), None);
        assert_eq!(jitter(&[10.0, 14.0]), Some(4.0));
        // diffs 2, 2, 40, 2 -> trimmed to [2, 2]
        assert_eq!(jitter(&[10.0, 12.0, 10.0, 50.0, 52.0]), Some(2.0));
    }

    #[test]
    fn test_variance_and_std_dev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(variance(&values), Some(4.0));
        assert_eq!(std_dev(&values), Some(2.0));
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(12.345, 1), 12.3);
        assert_eq!(round_to(12.35, 0), 12.0);
        assert_eq!(round_to(1.047_83, 4), 1.0478);
        assert_eq!(round_to(66.666, 1), 66.7);
    }

    #[test]
    fn test_mbps() {
        assert_eq!(mbps(12_500_000, Duration::from_secs(1)), 100.0);
        assert_eq!(mbps(1_000, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_stability() {
        let steady = stability(&[100.0, 100.0, 100.0]).unwrap();
        assert_eq!(steady.score, 100.0);
        assert_eq!(steady.variance, 0.0);

        let noisy = stability(&[10.0, 190.0]).unwrap();
        assert_eq!(noisy.score, 10.0);
        assert_eq!(noisy.sample_count, 2);

        assert!(stability(&[50.0]).is_none());
        assert!(stability(&[0.0, 0.0]).is_none());
    }
}
