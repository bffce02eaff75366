//! Statistical baselines of normal metric behavior.
//!
//! A baseline is established once per (target, configuration) pair from
//! a batch of samples. When the configuration changes, a fresh baseline
//! supersedes the old one; the old record is kept, not overwritten.

use crate::errors::{CanaryflowError, InsufficientDataError};
use crate::regression::RegressionAlert;
use crate::utils::{generate_uuid, now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Default minimum number of samples required to establish a baseline.
pub const DEFAULT_MIN_SAMPLE_SIZE: usize = 5;

/// Lifecycle status of a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineStatus {
    /// The authoritative baseline for its (target, configuration) pair.
    Active,
    /// Replaced by a newer baseline after a configuration change.
    Superseded,
    /// Marked stale by an operator; not used for gating.
    Stale,
}

/// A statistical snapshot of expected metric behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    /// Baseline id.
    pub id: Uuid,
    /// The target this baseline describes.
    pub target: String,
    /// Fingerprint of the configuration the samples were taken under.
    pub config_fingerprint: String,
    /// Number of samples the statistics were computed from.
    pub sample_size: usize,
    /// Sample mean.
    pub mean: f64,
    /// Sample standard deviation.
    pub std_dev: f64,
    /// Lifecycle status.
    pub status: BaselineStatus,
    /// When the baseline was established.
    pub created_at: Timestamp,
}

impl Baseline {
    /// Establishes a baseline from raw samples.
    ///
    /// # Errors
    ///
    /// Returns [`InsufficientDataError`] when fewer than `min_sample_size`
    /// samples are provided; no baseline record is created in that case.
    pub fn establish(
        target: impl Into<String>,
        config_fingerprint: impl Into<String>,
        samples: &[f64],
        min_sample_size: usize,
    ) -> Result<Self, CanaryflowError> {
        let target = target.into();
        if samples.len() < min_sample_size {
            return Err(
                InsufficientDataError::new(target, samples.len(), min_sample_size).into(),
            );
        }

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        Ok(Self {
            id: generate_uuid(),
            target,
            config_fingerprint: config_fingerprint.into(),
            sample_size: samples.len(),
            mean,
            std_dev: variance.sqrt(),
            status: BaselineStatus::Active,
            created_at: now_utc(),
        })
    }
}

/// Storage for baselines and the alerts raised against them.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// Stores a new baseline, superseding any active baseline for the
    /// same target.
    async fn put(&self, baseline: Baseline) -> Result<(), CanaryflowError>;

    /// Returns the active baseline for a target, if one exists.
    async fn active(&self, target: &str) -> Result<Option<Baseline>, CanaryflowError>;

    /// Appends a regression alert. Alerts are immutable once created.
    async fn record_alert(&self, alert: RegressionAlert) -> Result<(), CanaryflowError>;

    /// Returns all alerts recorded against a baseline, oldest first.
    async fn alerts(&self, baseline_id: Uuid) -> Result<Vec<RegressionAlert>, CanaryflowError>;
}

/// In-memory baseline store.
#[derive(Debug, Default)]
pub struct InMemoryBaselineStore {
    baselines: Mutex<HashMap<String, Vec<Baseline>>>,
    alerts: Mutex<HashMap<Uuid, Vec<RegressionAlert>>>,
}

impl InMemoryBaselineStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every baseline recorded for a target, oldest first.
    #[must_use]
    pub fn history(&self, target: &str) -> Vec<Baseline> {
        self.baselines
            .lock()
            .get(target)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BaselineStore for InMemoryBaselineStore {
    async fn put(&self, baseline: Baseline) -> Result<(), CanaryflowError> {
        let mut baselines = self.baselines.lock();
        let history = baselines.entry(baseline.target.clone()).or_default();
        for existing in history.iter_mut() {
            if existing.status == BaselineStatus::Active {
                existing.status = BaselineStatus::Superseded;
            }
        }
        history.push(baseline);
        Ok(())
    }

    async fn active(&self, target: &str) -> Result<Option<Baseline>, CanaryflowError> {
        Ok(self.baselines.lock().get(target).and_then(|history| {
            history
                .iter()
                .rev()
                .find(|b| b.status == BaselineStatus::Active)
                .cloned()
        }))
    }

    async fn record_alert(&self, alert: RegressionAlert) -> Result<(), CanaryflowError> {
        self.alerts
            .lock()
            .entry(alert.baseline_id)
            .or_default()
            .push(alert);
        Ok(())
    }

    async fn alerts(&self, baseline_id: Uuid) -> Result<Vec<RegressionAlert>, CanaryflowError> {
        Ok(self
            .alerts
            .lock()
            .get(&baseline_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::RegressionSeverity;

    #[test]
    fn test_establish_computes_statistics() {
        let samples = [80.0, 85.0, 90.0, 85.0, 85.0];
        let baseline = Baseline::establish("svc-a", "fp-1", &samples, 5).unwrap();

        assert_eq!(baseline.sample_size, 5);
        assert!((baseline.mean - 85.0).abs() < 1e-9);
        assert!(baseline.std_dev > 0.0);
        assert_eq!(baseline.status, BaselineStatus::Active);
    }

    #[test]
    fn test_establish_rejects_too_few_samples() {
        let err = Baseline::establish("svc-a", "fp-1", &[80.0, 90.0], 5).unwrap_err();
        assert!(matches!(err, CanaryflowError::InsufficientData(_)));
    }

    #[tokio::test]
    async fn test_new_baseline_supersedes_active() {
        let store = InMemoryBaselineStore::new();
        let samples = [80.0, 85.0, 90.0, 85.0, 85.0];

        let first = Baseline::establish("svc-a", "fp-1", &samples, 5).unwrap();
        let first_id = first.id;
        store.put(first).await.unwrap();

        let second = Baseline::establish("svc-a", "fp-2", &samples, 5).unwrap();
        let second_id = second.id;
        store.put(second).await.unwrap();

        let active = store.active("svc-a").await.unwrap().unwrap();
        assert_eq!(active.id, second_id);

        let history = store.history("svc-a");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first_id);
        assert_eq!(history[0].status, BaselineStatus::Superseded);
    }

    #[tokio::test]
    async fn test_alerts_append_only() {
        let store = InMemoryBaselineStore::new();
        let baseline =
            Baseline::establish("svc-a", "fp-1", &[80.0, 85.0, 90.0, 85.0, 85.0], 5).unwrap();
        let baseline_id = baseline.id;
        store.put(baseline).await.unwrap();

        for observed in [70.0, 60.0] {
            store
                .record_alert(RegressionAlert::new(
                    baseline_id,
                    observed,
                    50.0,
                    RegressionSeverity::Moderate,
                    "drop detected",
                ))
                .await
                .unwrap();
        }

        let alerts = store.alerts(baseline_id).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert!((alerts[0].observed_value - 70.0).abs() < f64::EPSILON);
    }
}
