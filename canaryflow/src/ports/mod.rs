//! Collaborator ports: interfaces to the systems canaryflow drives.
//!
//! The engine never performs the optimization itself. Metric collection
//! and change application live behind these traits so hosts can plug in
//! cloud-, GPU-, or quality-specific implementations.

use crate::core::{ChangeSpec, ConfigSnapshot, TargetRef};
use crate::errors::CanaryflowError;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One polled observation of a target's health dimensions.
///
/// Each dimension is pre-normalized by the collector to a 0-100 score
/// where higher is healthier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Output quality score.
    pub quality_score: f64,
    /// Latency score (100 = at or better than target latency).
    pub latency_score: f64,
    /// Cost-efficiency score.
    pub cost_score: f64,
    /// When the sample was taken.
    pub taken_at: Timestamp,
}

impl MetricSnapshot {
    /// Creates a snapshot taken now.
    #[must_use]
    pub fn new(quality_score: f64, latency_score: f64, cost_score: f64) -> Self {
        Self {
            quality_score,
            latency_score,
            cost_score,
            taken_at: now_utc(),
        }
    }
}

/// Polls live metrics for a target.
///
/// A sampling failure is a missed sample, not a regression; the health
/// monitor only escalates after a configurable consecutive-miss run.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Samples the target's current metrics.
    async fn sample(&self, target: &TargetRef) -> Result<MetricSnapshot, CanaryflowError>;
}

/// Result of applying a change at a stage percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    /// The percentage that is now running the new configuration.
    pub applied_percent: u8,
    /// Applier-specific detail (e.g. affected instance ids).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Result of reverting a target to a prior snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertResult {
    /// Fingerprint of the configuration the target was restored to.
    pub restored_fingerprint: String,
}

/// Applies and reverts configuration changes on a target.
#[async_trait]
pub trait ChangeApplier: Send + Sync {
    /// Reads the target's current configuration.
    ///
    /// Used to validate the target exists, to capture the pre-change
    /// snapshot, and to re-validate state before each stage application
    /// (the target is shared; out-of-band changes must be tolerated).
    async fn snapshot(&self, target: &TargetRef) -> Result<ConfigSnapshot, CanaryflowError>;

    /// Applies the change to `percentage` percent of the target.
    async fn apply(
        &self,
        target: &TargetRef,
        change: &ChangeSpec,
        percentage: u8,
    ) -> Result<ApplyResult, CanaryflowError>;

    /// Reverts the target to the given snapshot.
    async fn revert(
        &self,
        target: &TargetRef,
        snapshot: &ConfigSnapshot,
    ) -> Result<RevertResult, CanaryflowError>;
}
