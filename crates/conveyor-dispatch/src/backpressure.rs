//! Admission control near capacity.

use std::time::Duration;

use conveyor_config::BackPressureConfig;

/// Utilization at or above which submissions are always shed.
///
/// Configuration may lower the shedding point but never raise it.
pub const HARD_SHED_CEILING: f64 = 0.9;

/// Decision for a single submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Admit immediately.
    Admit,
    /// Delay the caller, then admit.
    Delay(Duration),
    /// Reject outright.
    Shed,
}

/// Decide how to admit a submission at `utilization` (0.0 - 1.0).
///
/// Between `threshold` and the shedding ceiling the delay ramps linearly
/// from zero to `max_delay_ms`.
pub fn admission(utilization: f64, config: &BackPressureConfig) -> Admission {
    let ceiling = config.critical.min(HARD_SHED_CEILING);
    if utilization >= ceiling {
        return Admission::Shed;
    }
    if !config.enabled || utilization <= config.threshold {
        return Admission::Admit;
    }

    let span = ceiling - config.threshold;
    if span <= 0.0 {
        return Admission::Delay(Duration::from_millis(config.max_delay_ms));
    }
    let ratio = ((utilization - config.threshold) / span).clamp(0.0, 1.0);
    let delay_ms = (config.max_delay_ms as f64 * ratio).round() as u64;
    Admission::Delay(Duration::from_millis(delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn delay_of(admission: Admission) -> Duration {
        match admission {
            Admission::Admit => Duration::ZERO,
            Admission::Delay(d) => d,
            Admission::Shed => Duration::MAX,
        }
    }

    #[test]
    fn test_below_threshold_admits() {
        let config = BackPressureConfig::default();
        assert_eq!(admission(0.0, &config), Admission::Admit);
        assert_eq!(admission(0.7, &config), Admission::Admit);
    }

    #[test]
    fn test_linear_ramp() {
        let config = BackPressureConfig::default();
        assert_eq!(admission(0.8, &config), Admission::Delay(Duration::from_millis(500)));
        assert_eq!(admission(0.85, &config), Admission::Delay(Duration::from_millis(750)));
    }

    #[test]
    fn test_sheds_at_critical() {
        let config = BackPressureConfig::default();
        assert_eq!(admission(0.9, &config), Admission::Shed);
        assert_eq!(admission(1.0, &config), Admission::Shed);
    }

    #[test]
    fn test_disabled_still_sheds() {
        let config = BackPressureConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(admission(0.85, &config), Admission::Admit);
        assert_eq!(admission(0.95, &config), Admission::Shed);
    }

    #[test]
    fn test_raised_critical_is_capped() {
        let config = BackPressureConfig {
            critical: 0.99,
            ..Default::default()
        };
        assert_eq!(admission(0.92, &config), Admission::Shed);
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic(a in 0.7f64..0.9, b in 0.7f64..0.9) {
            let config = BackPressureConfig::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(delay_of(admission(lo, &config)) <= delay_of(admission(hi, &config)));
        }

        #[test]
        fn prop_always_sheds_above_ceiling(
            u in 0.9f64..=1.0,
            enabled in any::<bool>(),
            threshold in 0.1f64..0.89,
            critical in 0.5f64..=1.0,
        ) {
            let config = BackPressureConfig { enabled, threshold, critical, max_delay_ms: 1000 };
            prop_assert_eq!(admission(u, &config), Admission::Shed);
        }
    }
}
