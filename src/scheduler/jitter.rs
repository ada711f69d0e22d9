//! Randomised delays between measurements.

use serde::Deserialize;
use std::time::Duration;

/// Shortest exponential delay, as a multiple of the period
const EXP_MIN_FACTOR: f64 = 0.1;
/// Longest exponential delay, as a multiple of the period
const EXP_MAX_FACTOR: f64 = 2.5;

/// How the delay between two measurements is drawn
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// `period × (1 ± jitter)`, uniformly distributed
    #[default]
    Uniform,
    /// Exponentially distributed around the period, clamped to
    /// `[0.1, 2.5] × period`; suited to long periods between heavy probes
    Exponential,
}

/// Delay for a uniform draw `u` in `[0, 1)`
pub fn delay_with(period: Duration, jitter: f64, mode: JitterMode, u: f64) -> Duration {
    let u = u.clamp(0.0, 1.0);
    match mode {
        JitterMode::Uniform => period.mul_f64(1.0 + jitter * (2.0 * u - 1.0)),
        JitterMode::Exponential => {
            let factor = -(1.0 - u).max(f64::MIN_POSITIVE).ln();
            period.mul_f64(factor.clamp(EXP_MIN_FACTOR, EXP_MAX_FACTOR))
        }
    }
}

/// Offset of the first measurement, so cadences sharing a period do not fire together
pub fn offset_with(period: Duration, jitter: f64, u: f64) -> Duration {
    period.mul_f64(jitter * u.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(10);

    #[test]
    fn test_uniform_stays_within_jitter() {
        assert_eq!(delay_with(PERIOD, 0.1, JitterMode::Uniform, 0.0), Duration::from_secs(9));
        assert_eq!(delay_with(PERIOD, 0.1, JitterMode::Uniform, 0.5), PERIOD);
        assert!(delay_with(PERIOD, 0.1, JitterMode::Uniform, 0.999_999) <= Duration::from_secs(11));
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        for u in [0.0, 0.3, 0.9] {
            assert_eq!(delay_with(PERIOD, 0.0, JitterMode::Uniform, u), PERIOD);
            assert_eq!(offset_with(PERIOD, 0.0, u), Duration::ZERO);
        }
    }

    #[test]
    fn test_exponential_is_clamped() {
        assert_eq!(delay_with(PERIOD, 0.0, JitterMode::Exponential, 0.0), Duration::from_secs(1));
        assert_eq!(delay_with(PERIOD, 0.0, JitterMode::Exponential, 0.999_999), Duration::from_secs(25));

        // 1 - e^-1 is the draw whose delay equals the period
        let mean_draw = 1.0 - (-1.0f64).exp();
        let delay = delay_with(PERIOD, 0.0, JitterMode::Exponential, mean_draw);
        assert!((delay.as_secs_f64() - 10.0).abs() < 1e-6);
    }
}
