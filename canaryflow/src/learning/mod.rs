//! Outcome learning: feeding rollout results back into approval policy.
//!
//! A pure side-effect sink. The engine records every terminal outcome
//! keyed by the change spec's shape; the approval gate later asks for an
//! impact bias derived from how past changes of the same shape landed.
//! Recorder failures never affect workflow status.

use crate::core::{WorkflowExecution, WorkflowStatus};
use crate::errors::CanaryflowError;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One recorded workflow outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Shape key of the change that ran.
    pub shape_key: String,
    /// The workflow that produced this outcome.
    pub workflow_id: Uuid,
    /// The target the change ran against.
    pub target: String,
    /// True when the workflow succeeded.
    pub succeeded: bool,
    /// The terminal status, as a string for storage friendliness.
    pub final_status: String,
    /// The cost delta estimated before the run.
    pub estimated_cost_delta: f64,
    /// The cost delta actually observed, when the host reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost_delta: Option<f64>,
    /// When the outcome was recorded.
    pub recorded_at: Timestamp,
}

impl OutcomeRecord {
    /// Builds a record from a terminal execution.
    #[must_use]
    pub fn from_execution(execution: &WorkflowExecution) -> Self {
        Self {
            shape_key: execution.change.shape_key(),
            workflow_id: execution.id,
            target: execution.target.to_string(),
            succeeded: execution.status == WorkflowStatus::Succeeded,
            final_status: execution.status.to_string(),
            estimated_cost_delta: execution.change.estimated_impact.cost_delta,
            actual_cost_delta: None,
            recorded_at: now_utc(),
        }
    }

    /// Attaches an observed cost delta.
    #[must_use]
    pub fn with_actual_cost_delta(mut self, delta: f64) -> Self {
        self.actual_cost_delta = Some(delta);
        self
    }
}

/// Sink for workflow outcomes.
#[async_trait]
pub trait LearningRecorder: Send + Sync {
    /// Appends an outcome record.
    async fn record(&self, record: OutcomeRecord) -> Result<(), CanaryflowError>;

    /// Returns all outcomes recorded for a change shape, oldest first.
    async fn outcomes(&self, shape_key: &str) -> Result<Vec<OutcomeRecord>, CanaryflowError>;

    /// Returns the mean actual-vs-estimated cost ratio for a shape, when
    /// enough history with observed deltas exists.
    async fn impact_bias(&self, shape_key: &str) -> Result<Option<f64>, CanaryflowError> {
        let outcomes = self.outcomes(shape_key).await?;
        let ratios: Vec<f64> = outcomes
            .iter()
            .filter_map(|o| {
                let actual = o.actual_cost_delta?;
                (o.estimated_cost_delta.abs() > f64::EPSILON)
                    .then(|| (actual / o.estimated_cost_delta).abs())
            })
            .collect();
        if ratios.is_empty() {
            return Ok(None);
        }
        Ok(Some(ratios.iter().sum::<f64>() / ratios.len() as f64))
    }
}

/// In-memory learning recorder.
#[derive(Debug, Default)]
pub struct InMemoryLearningRecorder {
    records: Mutex<HashMap<String, Vec<OutcomeRecord>>>,
}

impl InMemoryLearningRecorder {
    /// Creates a new recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of recorded outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().values().map(Vec::len).sum()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LearningRecorder for InMemoryLearningRecorder {
    async fn record(&self, record: OutcomeRecord) -> Result<(), CanaryflowError> {
        self.records
            .lock()
            .entry(record.shape_key.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn outcomes(&self, shape_key: &str) -> Result<Vec<OutcomeRecord>, CanaryflowError> {
        Ok(self
            .records
            .lock()
            .get(shape_key)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeSpec, EstimatedImpact, OptimizationKind, TargetRef};
    use crate::rollout::RolloutPlan;

    fn terminal_execution(status: WorkflowStatus) -> WorkflowExecution {
        let mut exec = WorkflowExecution::new(
            TargetRef::new("web-01", "vm"),
            ChangeSpec::new("resize", OptimizationKind::Cost)
                .with_parameter("instance_type", serde_json::json!("m5.large"))
                .with_estimated_impact(EstimatedImpact::new(-100.0, 4)),
            RolloutPlan::default(),
        );
        exec.status = status;
        exec
    }

    #[tokio::test]
    async fn test_record_and_lookup_by_shape() {
        let recorder = InMemoryLearningRecorder::new();
        let exec = terminal_execution(WorkflowStatus::Succeeded);
        let shape = exec.change.shape_key();

        recorder
            .record(OutcomeRecord::from_execution(&exec))
            .await
            .unwrap();

        let outcomes = recorder.outcomes(&shape).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded);
        assert_eq!(outcomes[0].final_status, "succeeded");
    }

    #[tokio::test]
    async fn test_impact_bias_from_history() {
        let recorder = InMemoryLearningRecorder::new();
        let exec = terminal_execution(WorkflowStatus::Succeeded);
        let shape = exec.change.shape_key();

        // Two outcomes landing at 2x and 4x their estimates.
        recorder
            .record(OutcomeRecord::from_execution(&exec).with_actual_cost_delta(-200.0))
            .await
            .unwrap();
        recorder
            .record(OutcomeRecord::from_execution(&exec).with_actual_cost_delta(-400.0))
            .await
            .unwrap();

        let bias = recorder.impact_bias(&shape).await.unwrap().unwrap();
        assert!((bias - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_impact_bias_none_without_observed_deltas() {
        let recorder = InMemoryLearningRecorder::new();
        let exec = terminal_execution(WorkflowStatus::RolledBack);
        let shape = exec.change.shape_key();

        recorder
            .record(OutcomeRecord::from_execution(&exec))
            .await
            .unwrap();

        assert!(recorder.impact_bias(&shape).await.unwrap().is_none());
    }
}
