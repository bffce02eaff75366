//! Regression detection against established baselines.
//!
//! The primary signal is the percentage drop of an observed value below
//! the baseline mean, bucketed into severities. A secondary z-score
//! signal catches volatility regressions whose mean drop is small.

use crate::baseline::Baseline;
use crate::utils::{generate_uuid, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Graded severity of a detected regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionSeverity {
    /// Drop in the minor band.
    Minor,
    /// Drop in the moderate band.
    Moderate,
    /// Drop in the severe band; escalates.
    Severe,
    /// Drop at or beyond the critical threshold; escalates.
    Critical,
}

impl RegressionSeverity {
    /// Returns true if this severity forces an immediate stage abort
    /// instead of waiting out the monitoring window.
    #[must_use]
    pub fn escalates(self) -> bool {
        matches!(self, Self::Severe | Self::Critical)
    }
}

impl std::fmt::Display for RegressionSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Severity band edges, expressed as fractional drops below the mean.
///
/// The default bands are policy, not law: per-metric deployments may
/// tune them without touching the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionThresholds {
    /// Below this drop no regression is reported.
    pub minor: f64,
    /// Start of the moderate band.
    pub moderate: f64,
    /// Start of the severe band.
    pub severe: f64,
    /// Start of the critical band.
    pub critical: f64,
    /// Absolute z-score beyond which an observation is anomalous even
    /// when the mean drop is small.
    pub z_score: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self {
            minor: 0.05,
            moderate: 0.10,
            severe: 0.20,
            critical: 0.35,
            z_score: 3.0,
        }
    }
}

impl RegressionThresholds {
    /// Buckets a fractional drop into a severity, if it crosses the
    /// minor threshold.
    #[must_use]
    pub fn classify(&self, drop_pct: f64) -> Option<RegressionSeverity> {
        if drop_pct >= self.critical {
            Some(RegressionSeverity::Critical)
        } else if drop_pct >= self.severe {
            Some(RegressionSeverity::Severe)
        } else if drop_pct >= self.moderate {
            Some(RegressionSeverity::Moderate)
        } else if drop_pct >= self.minor {
            Some(RegressionSeverity::Minor)
        } else {
            None
        }
    }
}

/// An alert raised when a detector run crosses the regression threshold.
///
/// Immutable once created; persisted append-only against its baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionAlert {
    /// Alert id.
    pub id: Uuid,
    /// The baseline the observation was compared against.
    pub baseline_id: Uuid,
    /// The observed value that triggered the alert.
    pub observed_value: f64,
    /// Remaining-quality score, 0-100.
    pub regression_score: f64,
    /// Graded severity.
    pub severity: RegressionSeverity,
    /// Human-readable description.
    pub message: String,
    /// When the alert was raised.
    pub created_at: Timestamp,
}

impl RegressionAlert {
    /// Creates a new alert.
    #[must_use]
    pub fn new(
        baseline_id: Uuid,
        observed_value: f64,
        regression_score: f64,
        severity: RegressionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_uuid(),
            baseline_id,
            observed_value,
            regression_score,
            severity,
            message: message.into(),
            created_at: now_utc(),
        }
    }
}

/// Outcome of one detector run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionResult {
    /// Whether a regression was detected.
    pub detected: bool,
    /// Remaining-quality score: `100 - drop_pct * 100`, clamped to [0, 100].
    pub regression_score: f64,
    /// Percentage drop below the baseline mean (may be negative when the
    /// observation improved on the baseline).
    pub quality_drop_pct: f64,
    /// Severity, present only when detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<RegressionSeverity>,
    /// True when the stage controller should abort immediately.
    pub escalate: bool,
    /// Alert raised for this run, present only when detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<RegressionAlert>,
}

impl RegressionResult {
    fn clean(regression_score: f64, quality_drop_pct: f64) -> Self {
        Self {
            detected: false,
            regression_score,
            quality_drop_pct,
            severity: None,
            escalate: false,
            alert: None,
        }
    }
}

/// Compares live observations against baselines.
#[derive(Debug, Clone, Default)]
pub struct RegressionDetector {
    thresholds: RegressionThresholds,
}

impl RegressionDetector {
    /// Creates a detector with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a detector with custom thresholds.
    #[must_use]
    pub fn with_thresholds(thresholds: RegressionThresholds) -> Self {
        Self { thresholds }
    }

    /// Returns the thresholds in use.
    #[must_use]
    pub fn thresholds(&self) -> &RegressionThresholds {
        &self.thresholds
    }

    /// Compares an observed value against a baseline.
    ///
    /// A regression is detected when the fractional drop below the
    /// baseline mean reaches the minor threshold, or when the z-score of
    /// the observation exceeds the anomaly threshold regardless of the
    /// drop's size.
    #[must_use]
    pub fn detect(&self, baseline: &Baseline, observed: f64) -> RegressionResult {
        let drop_pct = if baseline.mean.abs() < f64::EPSILON {
            0.0
        } else {
            (baseline.mean - observed) / baseline.mean
        };
        let regression_score = (100.0 - drop_pct * 100.0).clamp(0.0, 100.0);

        let z = if baseline.std_dev > f64::EPSILON {
            (observed - baseline.mean) / baseline.std_dev
        } else {
            0.0
        };
        let anomalous = z.abs() > self.thresholds.z_score;

        let severity = match self.thresholds.classify(drop_pct) {
            Some(severity) => severity,
            // A volatility anomaly counts as a detection even when the
            // mean drop is below the minor band.
            None if anomalous => RegressionSeverity::Minor,
            None => return RegressionResult::clean(regression_score, drop_pct * 100.0),
        };

        let message = if anomalous && drop_pct < self.thresholds.minor {
            format!(
                "anomalous observation {observed:.2} (z={z:.1}) against baseline mean {:.2}",
                baseline.mean
            )
        } else {
            format!(
                "{severity} regression: observed {observed:.2} is {:.1}% below baseline mean {:.2}",
                drop_pct * 100.0,
                baseline.mean
            )
        };

        let alert = RegressionAlert::new(
            baseline.id,
            observed,
            regression_score,
            severity,
            message,
        );

        RegressionResult {
            detected: true,
            regression_score,
            quality_drop_pct: drop_pct * 100.0,
            severity: Some(severity),
            escalate: severity.escalates(),
            alert: Some(alert),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn baseline_with(mean: f64, std_dev: f64) -> Baseline {
        // Five identical-spread samples are irrelevant here; construct
        // the statistics directly through establish on synthetic data.
        let samples = [
            mean - std_dev,
            mean - std_dev,
            mean,
            mean + std_dev,
            mean + std_dev,
        ];
        let mut baseline = Baseline::establish("svc-a", "fp-1", &samples, 5).unwrap();
        baseline.mean = mean;
        baseline.std_dev = std_dev;
        baseline
    }

    #[test]
    fn test_small_drop_is_not_a_regression() {
        let detector = RegressionDetector::new();
        let result = detector.detect(&baseline_with(85.0, 2.0), 82.0);

        assert!(!result.detected);
        assert!(result.severity.is_none());
        assert!(result.alert.is_none());
    }

    #[test]
    fn test_severity_buckets() {
        let detector = RegressionDetector::new();
        let baseline = baseline_with(85.0, 20.0);

        let cases = [
            (79.0, RegressionSeverity::Minor),    // ~7% drop
            (72.0, RegressionSeverity::Moderate), // ~15% drop
            (60.0, RegressionSeverity::Severe),   // ~29% drop
            (50.0, RegressionSeverity::Critical), // ~41% drop
        ];

        for (observed, expected) in cases {
            let result = detector.detect(&baseline, observed);
            assert!(result.detected, "observed {observed} should detect");
            assert_eq!(result.severity, Some(expected));
        }
    }

    #[test]
    fn test_escalation_only_for_severe_and_critical() {
        let detector = RegressionDetector::new();
        let baseline = baseline_with(85.0, 20.0);

        assert!(!detector.detect(&baseline, 79.0).escalate);
        assert!(!detector.detect(&baseline, 72.0).escalate);
        assert!(detector.detect(&baseline, 60.0).escalate);
        assert!(detector.detect(&baseline, 50.0).escalate);
    }

    #[test]
    fn test_regression_score_clamped() {
        let detector = RegressionDetector::new();
        let baseline = baseline_with(85.0, 20.0);

        let improved = detector.detect(&baseline, 95.0);
        assert!((improved.regression_score - 100.0).abs() < f64::EPSILON);

        let collapsed = detector.detect(&baseline, -100.0);
        assert!((collapsed.regression_score - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_z_score_anomaly_detects_small_drop() {
        let detector = RegressionDetector::new();
        // Tight baseline: a 3.5% drop is > 3 standard deviations out.
        let baseline = baseline_with(85.0, 0.5);

        let result = detector.detect(&baseline, 82.0);
        assert!(result.detected);
        assert_eq!(result.severity, Some(RegressionSeverity::Minor));
        assert!(result.alert.unwrap().message.contains("anomalous"));
    }

    #[test]
    fn test_alert_carries_baseline_reference() {
        let detector = RegressionDetector::new();
        let baseline = baseline_with(85.0, 20.0);

        let result = detector.detect(&baseline, 60.0);
        let alert = result.alert.unwrap();
        assert_eq!(alert.baseline_id, baseline.id);
        assert_eq!(alert.severity, RegressionSeverity::Severe);
        assert!(alert.message.contains("severe"));
    }

    #[test]
    fn test_custom_thresholds() {
        let detector = RegressionDetector::with_thresholds(RegressionThresholds {
            minor: 0.01,
            moderate: 0.02,
            severe: 0.03,
            critical: 0.04,
            z_score: 3.0,
        });
        let baseline = baseline_with(100.0, 50.0);

        let result = detector.detect(&baseline, 95.0);
        assert_eq!(result.severity, Some(RegressionSeverity::Critical));
    }
}
