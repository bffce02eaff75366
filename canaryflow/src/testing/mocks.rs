//! In-memory port implementations with scriptable failure modes.

use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
use crate::core::{ChangeSpec, ConfigSnapshot, TargetRef};
use crate::errors::CanaryflowError;
use crate::ports::{ApplyResult, ChangeApplier, MetricSnapshot, MetricsCollector, RevertResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A change applier backed by a mutable in-memory configuration.
///
/// Records every applied percentage and every revert so tests can assert
/// on the exact sequence of actions taken against the target.
pub struct MockChangeApplier {
    config: Mutex<serde_json::Value>,
    applied: Mutex<Vec<u8>>,
    reverts: AtomicUsize,
    fail_apply_at: Option<u8>,
    fail_revert: bool,
    fail_snapshot: bool,
}

impl MockChangeApplier {
    /// Creates an applier whose target currently holds `config`.
    #[must_use]
    pub fn new(config: serde_json::Value) -> Self {
        Self {
            config: Mutex::new(config),
            applied: Mutex::new(Vec::new()),
            reverts: AtomicUsize::new(0),
            fail_apply_at: None,
            fail_revert: false,
            fail_snapshot: false,
        }
    }

    /// Makes every apply at the given percentage fail.
    #[must_use]
    pub fn fail_apply_at_percent(mut self, percent: u8) -> Self {
        self.fail_apply_at = Some(percent);
        self
    }

    /// Makes every revert fail.
    #[must_use]
    pub fn fail_revert(mut self) -> Self {
        self.fail_revert = true;
        self
    }

    /// Makes every snapshot read fail, simulating an unknown target.
    #[must_use]
    pub fn fail_snapshot(mut self) -> Self {
        self.fail_snapshot = true;
        self
    }

    /// The percentages applied so far, in order.
    #[must_use]
    pub fn applied_percents(&self) -> Vec<u8> {
        self.applied.lock().clone()
    }

    /// How many reverts were attempted.
    #[must_use]
    pub fn revert_count(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }

    /// The target's current configuration.
    #[must_use]
    pub fn current_config(&self) -> serde_json::Value {
        self.config.lock().clone()
    }
}

#[async_trait]
impl ChangeApplier for MockChangeApplier {
    async fn snapshot(&self, target: &TargetRef) -> Result<ConfigSnapshot, CanaryflowError> {
        if self.fail_snapshot {
            return Err(crate::errors::NotFoundError::new("target", target.to_string()).into());
        }
        Ok(ConfigSnapshot::capture(self.config.lock().clone()))
    }

    async fn apply(
        &self,
        target: &TargetRef,
        change: &ChangeSpec,
        percentage: u8,
    ) -> Result<ApplyResult, CanaryflowError> {
        if self.fail_apply_at == Some(percentage) {
            return Err(CanaryflowError::Apply {
                target: target.to_string(),
                percent: percentage,
                reason: "injected apply failure".to_string(),
            });
        }

        self.applied.lock().push(percentage);

        // Fold the change's parameters into the stored configuration so a
        // later snapshot reflects what was applied.
        let mut config = self.config.lock();
        if let serde_json::Value::Object(map) = &mut *config {
            for (key, value) in &change.parameters {
                map.insert(key.clone(), value.clone());
            }
            map.insert(
                "canary_percent".to_string(),
                serde_json::json!(percentage),
            );
        }

        Ok(ApplyResult {
            applied_percent: percentage,
            detail: None,
        })
    }

    async fn revert(
        &self,
        target: &TargetRef,
        snapshot: &ConfigSnapshot,
    ) -> Result<RevertResult, CanaryflowError> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        if self.fail_revert {
            return Err(CanaryflowError::Apply {
                target: target.to_string(),
                percent: 0,
                reason: "injected revert failure".to_string(),
            });
        }
        *self.config.lock() = snapshot.config.clone();
        Ok(RevertResult {
            restored_fingerprint: snapshot.fingerprint.clone(),
        })
    }
}

enum CollectorMode {
    Steady(f64, f64, f64),
    Failing,
    /// Scores keyed by the applier's most recently applied percentage.
    PerPercent {
        applier: Arc<MockChangeApplier>,
        scores: Vec<(u8, f64)>,
        default_score: f64,
    },
}

/// A metrics collector producing scripted samples.
pub struct MockMetricsCollector {
    mode: CollectorMode,
    samples: AtomicUsize,
}

impl MockMetricsCollector {
    /// Always returns the same three dimension scores.
    #[must_use]
    pub fn steady(quality: f64, latency: f64, cost: f64) -> Self {
        Self {
            mode: CollectorMode::Steady(quality, latency, cost),
            samples: AtomicUsize::new(0),
        }
    }

    /// Every sample fails, simulating an unreachable metrics source.
    #[must_use]
    pub fn always_failing() -> Self {
        Self {
            mode: CollectorMode::Failing,
            samples: AtomicUsize::new(0),
        }
    }

    /// Scores follow the applier's current canary percentage, defaulting
    /// to a healthy 90 for percentages with no explicit entry.
    ///
    /// Lets a test degrade the target at a chosen stage, e.g. healthy at
    /// 10% and regressed once 50% is applied.
    #[must_use]
    pub fn tracking(applier: Arc<MockChangeApplier>) -> Self {
        Self {
            mode: CollectorMode::PerPercent {
                applier,
                scores: Vec::new(),
                default_score: 90.0,
            },
            samples: AtomicUsize::new(0),
        }
    }

    /// Sets the uniform score reported while the given percentage is the
    /// most recently applied one. Only valid in tracking mode.
    #[must_use]
    pub fn with_score_at_percent(mut self, percent: u8, score: f64) -> Self {
        if let CollectorMode::PerPercent { scores, .. } = &mut self.mode {
            scores.push((percent, score));
        }
        self
    }

    /// How many samples were requested (including failed ones).
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsCollector for MockMetricsCollector {
    async fn sample(&self, target: &TargetRef) -> Result<MetricSnapshot, CanaryflowError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            CollectorMode::Steady(quality, latency, cost) => {
                Ok(MetricSnapshot::new(*quality, *latency, *cost))
            }
            CollectorMode::Failing => Err(CanaryflowError::Persistence(format!(
                "metrics source unreachable for {target}"
            ))),
            CollectorMode::PerPercent {
                applier,
                scores,
                default_score,
            } => {
                let current = applier.applied_percents().last().copied().unwrap_or(0);
                let score = scores
                    .iter()
                    .find(|(p, _)| *p == current)
                    .map_or(*default_score, |(_, s)| *s);
                Ok(MetricSnapshot::new(score, score, score))
            }
        }
    }
}

/// A checkpoint store that fails a scripted number of appends before
/// delegating to an in-memory store.
///
/// Used to exercise the engine's bounded checkpoint retry: transient
/// failures are retried, and an exhausted retry budget aborts the
/// transition.
pub struct FlakyCheckpointStore {
    inner: InMemoryCheckpointStore,
    successes_remaining: AtomicUsize,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyCheckpointStore {
    /// Creates a store whose first `failures` appends fail.
    #[must_use]
    pub fn failing_first(failures: usize) -> Self {
        Self::failing_after(0, failures)
    }

    /// Creates a store that accepts `successes` appends, fails the next
    /// `failures` appends, then recovers.
    #[must_use]
    pub fn failing_after(successes: usize, failures: usize) -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            successes_remaining: AtomicUsize::new(successes),
            failures_remaining: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// How many appends were attempted, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of checkpoints durably stored for a workflow.
    #[must_use]
    pub fn len(&self, workflow_id: Uuid) -> usize {
        self.inner.len(workflow_id)
    }

    /// Returns true if no checkpoints are stored for the workflow.
    #[must_use]
    pub fn is_empty(&self, workflow_id: Uuid) -> bool {
        self.inner.is_empty(workflow_id)
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn append(&self, checkpoint: Checkpoint) -> Result<(), CanaryflowError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let successes = self.successes_remaining.load(Ordering::SeqCst);
        if successes > 0 {
            self.successes_remaining.store(successes - 1, Ordering::SeqCst);
            return self.inner.append(checkpoint).await;
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CanaryflowError::Persistence(
                "injected checkpoint write failure".to_string(),
            ));
        }
        self.inner.append(checkpoint).await
    }

    async fn latest(&self, workflow_id: Uuid) -> Result<Option<Checkpoint>, CanaryflowError> {
        self.inner.latest(workflow_id).await
    }

    async fn chain(&self, workflow_id: Uuid) -> Result<Vec<Checkpoint>, CanaryflowError> {
        self.inner.chain(workflow_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OptimizationKind;

    #[tokio::test]
    async fn test_apply_updates_config_and_history() {
        let applier = MockChangeApplier::new(serde_json::json!({"cpu": 4}));
        let target = TargetRef::new("web-01", "vm");
        let change = ChangeSpec::new("resize", OptimizationKind::Cost)
            .with_parameter("cpu", serde_json::json!(2));

        applier.apply(&target, &change, 10).await.unwrap();
        applier.apply(&target, &change, 50).await.unwrap();

        assert_eq!(applier.applied_percents(), vec![10, 50]);
        assert_eq!(applier.current_config()["cpu"], serde_json::json!(2));
        assert_eq!(
            applier.current_config()["canary_percent"],
            serde_json::json!(50)
        );
    }

    #[tokio::test]
    async fn test_revert_restores_snapshot() {
        let applier = MockChangeApplier::new(serde_json::json!({"cpu": 4}));
        let target = TargetRef::new("web-01", "vm");
        let before = applier.snapshot(&target).await.unwrap();

        let change = ChangeSpec::new("resize", OptimizationKind::Cost)
            .with_parameter("cpu", serde_json::json!(2));
        applier.apply(&target, &change, 100).await.unwrap();
        assert_ne!(applier.current_config(), before.config);

        applier.revert(&target, &before).await.unwrap();
        assert_eq!(applier.current_config(), before.config);
        assert_eq!(applier.revert_count(), 1);
    }

    #[tokio::test]
    async fn test_tracking_collector_follows_applied_percent() {
        let applier = Arc::new(MockChangeApplier::new(serde_json::json!({})));
        let collector = MockMetricsCollector::tracking(applier.clone())
            .with_score_at_percent(50, 40.0);
        let target = TargetRef::new("web-01", "vm");
        let change = ChangeSpec::new("resize", OptimizationKind::Cost);

        let healthy = collector.sample(&target).await.unwrap();
        assert!((healthy.quality_score - 90.0).abs() < f64::EPSILON);

        applier.apply(&target, &change, 50).await.unwrap();
        let degraded = collector.sample(&target).await.unwrap();
        assert!((degraded.quality_score - 40.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failing_after_opens_a_failure_window() {
        let store = FlakyCheckpointStore::failing_after(1, 1);
        let exec = crate::core::WorkflowExecution::new(
            TargetRef::new("web-01", "vm"),
            ChangeSpec::new("resize", OptimizationKind::Cost),
            crate::rollout::RolloutPlan::default(),
        );

        let first = Checkpoint::from_execution(&exec, None).unwrap();
        let second = Checkpoint::from_execution(&exec, Some(first.checkpoint_id)).unwrap();
        store.append(first).await.unwrap();
        assert!(store.append(second.clone()).await.is_err());
        store.append(second).await.unwrap();
        assert_eq!(store.len(exec.id), 2);
    }

    #[tokio::test]
    async fn test_flaky_store_recovers_after_failures() {
        let store = FlakyCheckpointStore::failing_first(2);
        let exec = crate::core::WorkflowExecution::new(
            TargetRef::new("web-01", "vm"),
            ChangeSpec::new("resize", OptimizationKind::Cost),
            crate::rollout::RolloutPlan::default(),
        );

        let cp = Checkpoint::from_execution(&exec, None).unwrap();
        assert!(store.append(cp.clone()).await.is_err());
        assert!(store.append(cp.clone()).await.is_err());
        store.append(cp).await.unwrap();
        assert_eq!(store.attempts(), 3);
        assert_eq!(store.len(exec.id), 1);
    }
}
