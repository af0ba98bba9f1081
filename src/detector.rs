//! Concentration dip detection
//!
//! A dip is a sample falling below a fixed fraction of the personal baseline.
//! The detector holds no per-session state; suppression of repeated triggers
//! while an exercise is outstanding belongs to the orchestrator.

use serde::{Deserialize, Serialize};

/// Default fraction of the baseline below which a sample counts as a dip
pub const DEFAULT_DIP_RATIO: f64 = 0.7;

/// Stateless dip decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DipDetector {
    dip_ratio: f64,
}

impl Default for DipDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DIP_RATIO)
    }
}

impl DipDetector {
    pub fn new(dip_ratio: f64) -> Self {
        Self { dip_ratio }
    }

    pub fn dip_ratio(&self) -> f64 {
        self.dip_ratio
    }

    /// Concentration level under which `baseline` is considered dipped
    pub fn threshold(&self, baseline: f64) -> f64 {
        baseline * self.dip_ratio
    }

    /// True iff a baseline is set and `value` is strictly below `baseline * dip_ratio`
    pub fn should_trigger(&self, value: f64, baseline: Option<f64>) -> bool {
        match baseline {
            Some(base) => value < self.threshold(base),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_baseline_never_triggers() {
        let detector = DipDetector::default();
        for value in [-100.0, 0.0, 1.0, 1e9] {
            assert!(!detector.should_trigger(value, None));
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let detector = DipDetector::default();
        // 0.7 * 80 = 56
        assert!(!detector.should_trigger(60.0, Some(80.0)));
        assert!(!detector.should_trigger(56.0, Some(80.0)));
        assert!(detector.should_trigger(55.9, Some(80.0)));
        assert!(detector.should_trigger(50.0, Some(80.0)));
    }

    #[test]
    fn test_matches_reference_definition() {
        let detector = DipDetector::default();
        for baseline in [10.0, 42.5, 80.0, 100.0] {
            for step in 0..200 {
                let value = step as f64 * 0.5;
                assert_eq!(
                    detector.should_trigger(value, Some(baseline)),
                    value < 0.7 * baseline,
                    "value={} baseline={}",
                    value,
                    baseline
                );
            }
        }
    }

    #[test]
    fn test_custom_ratio() {
        let detector = DipDetector::new(0.5);
        assert!(!detector.should_trigger(45.0, Some(80.0)));
        assert!(detector.should_trigger(39.0, Some(80.0)));
        assert_eq!(detector.dip_ratio(), 0.5);
    }
}
