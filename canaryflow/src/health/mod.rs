//! Health monitoring over a stage's canary window.
//!
//! The monitor polls the metrics collector at a fixed cadence for the
//! whole window. The window is a hard wait: it only ends early for an
//! escalating regression, a consecutive-miss run, or cancellation of
//! the owning workflow.

use crate::baseline::Baseline;
use crate::cancellation::CancellationToken;
use crate::core::TargetRef;
use crate::ports::{MetricSnapshot, MetricsCollector};
use crate::regression::{RegressionAlert, RegressionDetector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Weights for folding metric dimensions into one health score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthWeights {
    /// Weight of the quality dimension.
    pub quality: f64,
    /// Weight of the latency dimension.
    pub latency: f64,
    /// Weight of the cost dimension.
    pub cost: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            quality: 0.5,
            latency: 0.3,
            cost: 0.2,
        }
    }
}

impl HealthWeights {
    /// Scores one snapshot as a weighted 0-100 combination.
    #[must_use]
    pub fn score(&self, snapshot: &MetricSnapshot) -> f64 {
        let total = self.quality + self.latency + self.cost;
        if total <= f64::EPSILON {
            return 0.0;
        }
        let weighted = snapshot.quality_score * self.quality
            + snapshot.latency_score * self.latency
            + snapshot.cost_score * self.cost;
        (weighted / total).clamp(0.0, 100.0)
    }
}

/// Configuration for the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between metric polls.
    pub poll_interval_secs: f64,
    /// Dimension weights for the aggregate score.
    pub weights: HealthWeights,
    /// Consecutive missed samples treated as a severe failure.
    pub max_consecutive_misses: u32,
    /// Pass threshold used when no baseline exists for the target.
    pub min_healthy_score: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10.0,
            weights: HealthWeights::default(),
            max_consecutive_misses: 3,
            min_healthy_score: 70.0,
        }
    }
}

impl HealthConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval in seconds.
    #[must_use]
    pub fn with_poll_interval_secs(mut self, secs: f64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Sets the dimension weights.
    #[must_use]
    pub fn with_weights(mut self, weights: HealthWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Sets the consecutive-miss threshold.
    #[must_use]
    pub fn with_max_consecutive_misses(mut self, misses: u32) -> Self {
        self.max_consecutive_misses = misses;
        self
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.001))
    }
}

/// The outcome of one monitoring window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthVerdict {
    /// Aggregate 0-100 health score over the window.
    pub score: f64,
    /// True when no regression was detected.
    pub passed: bool,
    /// Alerts raised during the window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<RegressionAlert>,
    /// Number of samples collected.
    pub samples: usize,
    /// True when the window ended early due to cancellation; the score
    /// reflects the partial aggregate collected so far.
    pub cancelled: bool,
    /// True when the window ended early due to an escalating regression.
    pub escalated: bool,
    /// Failure description when the window did not pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthVerdict {
    /// Builds a passing verdict (test/helper constructor).
    #[must_use]
    pub fn passing(score: f64, samples: usize) -> Self {
        Self {
            score,
            passed: true,
            alerts: Vec::new(),
            samples,
            cancelled: false,
            escalated: false,
            detail: None,
        }
    }

    /// Builds a failing verdict (test/helper constructor).
    #[must_use]
    pub fn failing(score: f64, samples: usize, detail: impl Into<String>) -> Self {
        Self {
            score,
            passed: false,
            alerts: Vec::new(),
            samples,
            cancelled: false,
            escalated: false,
            detail: Some(detail.into()),
        }
    }

    /// Returns the failure description, preferring the alert message.
    #[must_use]
    pub fn failure_summary(&self) -> Option<String> {
        if self.passed {
            return None;
        }
        self.alerts
            .last()
            .map(|a| a.message.clone())
            .or_else(|| self.detail.clone())
    }
}

/// Polls live metrics for a stage's window and produces a verdict.
pub struct HealthMonitor {
    collector: Arc<dyn MetricsCollector>,
    detector: RegressionDetector,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(
        collector: Arc<dyn MetricsCollector>,
        detector: RegressionDetector,
        config: HealthConfig,
    ) -> Self {
        Self {
            collector,
            detector,
            config,
        }
    }

    /// Watches the target for `window`, sampling at the configured
    /// cadence, and produces a verdict against the baseline.
    ///
    /// Without a baseline, the window passes when the aggregate score
    /// meets `min_healthy_score`. The wait resolves promptly when the
    /// token is cancelled, returning whatever partial aggregate exists.
    pub async fn observe(
        &self,
        target: &TargetRef,
        baseline: Option<&Baseline>,
        window: Duration,
        token: &CancellationToken,
    ) -> HealthVerdict {
        let deadline = Instant::now() + window;
        let mut scores: Vec<f64> = Vec::new();
        let mut alerts: Vec<RegressionAlert> = Vec::new();
        let mut consecutive_misses = 0u32;

        loop {
            if token.is_cancelled() {
                return self.partial_verdict(&scores, alerts, true);
            }

            match self.collector.sample(target).await {
                Ok(snapshot) => {
                    consecutive_misses = 0;
                    let score = self.config.weights.score(&snapshot);
                    scores.push(score);
                    debug!(target = %target, score, "health sample");

                    // Escalating severities abort the window immediately
                    // instead of waiting it out.
                    if let Some(baseline) = baseline {
                        let result = self.detector.detect(baseline, score);
                        if result.escalate {
                            alerts.extend(result.alert);
                            let aggregate = mean(&scores);
                            return HealthVerdict {
                                score: aggregate,
                                passed: false,
                                alerts,
                                samples: scores.len(),
                                cancelled: false,
                                escalated: true,
                                detail: Some(format!(
                                    "escalating regression at sample {} (score {score:.1})",
                                    scores.len()
                                )),
                            };
                        }
                    }
                }
                Err(err) => {
                    consecutive_misses += 1;
                    warn!(
                        target = %target,
                        misses = consecutive_misses,
                        error = %err,
                        "missed metric sample"
                    );
                    if consecutive_misses >= self.config.max_consecutive_misses {
                        let aggregate = mean(&scores);
                        return HealthVerdict {
                            score: aggregate,
                            passed: false,
                            alerts,
                            samples: scores.len(),
                            cancelled: false,
                            escalated: false,
                            detail: Some(format!(
                                "{consecutive_misses} consecutive missed samples, treating as severe"
                            )),
                        };
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let tick = self.config.poll_interval().min(deadline - now);
            tokio::select! {
                () = tokio::time::sleep(tick) => {}
                () = token.cancelled_wait() => {
                    return self.partial_verdict(&scores, alerts, true);
                }
            }
        }

        self.closing_verdict(scores, alerts, baseline)
    }

    fn partial_verdict(
        &self,
        scores: &[f64],
        alerts: Vec<RegressionAlert>,
        cancelled: bool,
    ) -> HealthVerdict {
        HealthVerdict {
            score: mean(scores),
            passed: false,
            alerts,
            samples: scores.len(),
            cancelled,
            escalated: false,
            detail: Some("monitoring window interrupted by cancellation".to_string()),
        }
    }

    fn closing_verdict(
        &self,
        scores: Vec<f64>,
        mut alerts: Vec<RegressionAlert>,
        baseline: Option<&Baseline>,
    ) -> HealthVerdict {
        if scores.is_empty() {
            return HealthVerdict {
                score: 0.0,
                passed: false,
                alerts,
                samples: 0,
                cancelled: false,
                escalated: false,
                detail: Some("no samples collected during monitoring window".to_string()),
            };
        }

        let aggregate = mean(&scores);

        let (passed, detail) = match baseline {
            Some(baseline) => {
                let result = self.detector.detect(baseline, aggregate);
                let detail = result
                    .alert
                    .as_ref()
                    .map(|a| a.message.clone());
                alerts.extend(result.alert);
                (!result.detected, detail)
            }
            None => {
                let passed = aggregate >= self.config.min_healthy_score;
                let detail = (!passed).then(|| {
                    format!(
                        "aggregate score {aggregate:.1} below healthy floor {:.1} (no baseline)",
                        self.config.min_healthy_score
                    )
                });
                (passed, detail)
            }
        };

        HealthVerdict {
            score: aggregate,
            passed,
            alerts,
            samples: scores.len(),
            cancelled: false,
            escalated: false,
            detail,
        }
    }
}

fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMetricsCollector;

    fn target() -> TargetRef {
        TargetRef::new("web-01", "vm")
    }

    fn baseline(mean: f64, std_dev: f64) -> Baseline {
        let mut b =
            Baseline::establish("vm/web-01", "fp-1", &[mean; 5], 5).unwrap();
        b.mean = mean;
        b.std_dev = std_dev;
        b
    }

    fn monitor(collector: Arc<MockMetricsCollector>) -> HealthMonitor {
        HealthMonitor::new(
            collector,
            RegressionDetector::new(),
            HealthConfig::new().with_poll_interval_secs(0.005),
        )
    }

    #[test]
    fn test_weights_score_combination() {
        let weights = HealthWeights::default();
        let snapshot = MetricSnapshot::new(100.0, 100.0, 100.0);
        assert!((weights.score(&snapshot) - 100.0).abs() < 1e-9);

        let mixed = MetricSnapshot::new(80.0, 60.0, 40.0);
        // 0.5*80 + 0.3*60 + 0.2*40 = 66
        assert!((weights.score(&mixed) - 66.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_healthy_window_passes() {
        let collector = Arc::new(MockMetricsCollector::steady(90.0, 90.0, 90.0));
        let monitor = monitor(collector);
        let token = CancellationToken::new();

        let verdict = monitor
            .observe(
                &target(),
                Some(&baseline(85.0, 10.0)),
                Duration::from_millis(30),
                &token,
            )
            .await;

        assert!(verdict.passed);
        assert!(verdict.samples >= 1);
        assert!(verdict.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_regressed_window_fails_with_alert() {
        let collector = Arc::new(MockMetricsCollector::steady(72.0, 72.0, 72.0));
        let monitor = monitor(collector);
        let token = CancellationToken::new();

        let verdict = monitor
            .observe(
                &target(),
                Some(&baseline(85.0, 20.0)),
                Duration::from_millis(30),
                &token,
            )
            .await;

        assert!(!verdict.passed);
        assert!(!verdict.alerts.is_empty());
        assert!(verdict.failure_summary().unwrap().contains("moderate"));
    }

    #[tokio::test]
    async fn test_escalating_regression_ends_window_early() {
        let collector = Arc::new(MockMetricsCollector::steady(40.0, 40.0, 40.0));
        let monitor = monitor(collector);
        let token = CancellationToken::new();

        let start = std::time::Instant::now();
        let verdict = monitor
            .observe(
                &target(),
                Some(&baseline(85.0, 20.0)),
                Duration::from_secs(30),
                &token,
            )
            .await;

        assert!(!verdict.passed);
        assert!(verdict.escalated);
        assert_eq!(verdict.samples, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_resolves_promptly() {
        let collector = Arc::new(MockMetricsCollector::steady(90.0, 90.0, 90.0));
        let monitor = monitor(collector);
        let token = CancellationToken::new();

        let cancel_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_token.cancel("operator requested");
        });

        let start = std::time::Instant::now();
        let verdict = monitor
            .observe(&target(), None, Duration::from_secs(60), &token)
            .await;

        assert!(verdict.cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(verdict.samples >= 1);
    }

    #[tokio::test]
    async fn test_consecutive_misses_fail_the_window() {
        let collector = Arc::new(MockMetricsCollector::always_failing());
        let monitor = HealthMonitor::new(
            collector,
            RegressionDetector::new(),
            HealthConfig::new()
                .with_poll_interval_secs(0.005)
                .with_max_consecutive_misses(3),
        );
        let token = CancellationToken::new();

        let verdict = monitor
            .observe(
                &target(),
                Some(&baseline(85.0, 10.0)),
                Duration::from_secs(30),
                &token,
            )
            .await;

        assert!(!verdict.passed);
        assert_eq!(verdict.samples, 0);
        assert!(verdict.detail.unwrap().contains("consecutive missed"));
    }

    #[tokio::test]
    async fn test_no_baseline_uses_healthy_floor() {
        let collector = Arc::new(MockMetricsCollector::steady(60.0, 60.0, 60.0));
        let monitor = monitor(collector);
        let token = CancellationToken::new();

        let verdict = monitor
            .observe(&target(), None, Duration::from_millis(20), &token)
            .await;

        assert!(!verdict.passed);
        assert!(verdict.detail.unwrap().contains("no baseline"));
    }
}
