//! Rollout plans: the fixed, ordered canary progression.

use crate::errors::{CanaryflowError, ValidationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One stage of a graduated rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStage {
    /// Percentage of the target exposed to the change (0-100).
    pub percent: u8,
    /// Seconds to monitor before advancing past this stage.
    pub monitor_secs: u64,
}

impl RolloutStage {
    /// Creates a new stage.
    #[must_use]
    pub fn new(percent: u8, monitor_secs: u64) -> Self {
        Self {
            percent,
            monitor_secs,
        }
    }

    /// Returns the monitoring window as a duration.
    #[must_use]
    pub fn monitor_window(&self) -> Duration {
        Duration::from_secs(self.monitor_secs)
    }
}

/// An ordered, monotonic canary progression.
///
/// Not persisted as its own entity: the plan travels inside the
/// workflow execution so resume sees exactly the progression the run
/// started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPlan {
    stages: Vec<RolloutStage>,
}

impl Default for RolloutPlan {
    /// The default 10% / 50% / 100% progression with five-minute
    /// monitoring windows.
    fn default() -> Self {
        Self {
            stages: vec![
                RolloutStage::new(10, 300),
                RolloutStage::new(50, 300),
                RolloutStage::new(100, 300),
            ],
        }
    }
}

impl RolloutPlan {
    /// Builds a plan from explicit stages.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the plan is empty, a percentage
    /// exceeds 100, the sequence decreases, or it does not end at 100%.
    pub fn new(stages: Vec<RolloutStage>) -> Result<Self, CanaryflowError> {
        if stages.is_empty() {
            return Err(ValidationError::new("rollout plan has no stages")
                .with_field("stages")
                .into());
        }

        let mut previous = 0u8;
        for stage in &stages {
            if stage.percent > 100 {
                return Err(ValidationError::new(format!(
                    "stage percentage {} exceeds 100",
                    stage.percent
                ))
                .with_field("stages")
                .into());
            }
            if stage.percent < previous {
                return Err(ValidationError::new(format!(
                    "stage percentages must be non-decreasing ({previous} -> {})",
                    stage.percent
                ))
                .with_field("stages")
                .into());
            }
            previous = stage.percent;
        }

        if previous != 100 {
            return Err(
                ValidationError::new("rollout plan must end at 100%")
                    .with_field("stages")
                    .into(),
            );
        }

        Ok(Self { stages })
    }

    /// Builds a plan from percentages with a uniform monitoring window.
    ///
    /// # Errors
    ///
    /// Same validation as [`RolloutPlan::new`].
    pub fn percentages(percents: &[u8], monitor_secs: u64) -> Result<Self, CanaryflowError> {
        Self::new(
            percents
                .iter()
                .map(|&p| RolloutStage::new(p, monitor_secs))
                .collect(),
        )
    }

    /// Returns the stage at the given index.
    #[must_use]
    pub fn stage(&self, index: u32) -> Option<&RolloutStage> {
        self.stages.get(index as usize)
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> u32 {
        u32::try_from(self.stages.len()).unwrap_or(u32::MAX)
    }

    /// Returns true if the plan has no stages. Valid plans never do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns true if the index refers to the final (100%) stage.
    #[must_use]
    pub fn is_last(&self, index: u32) -> bool {
        index + 1 == self.len()
    }

    /// Returns the stages in order.
    #[must_use]
    pub fn stages(&self) -> &[RolloutStage] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan() {
        let plan = RolloutPlan::default();
        let percents: Vec<u8> = plan.stages().iter().map(|s| s.percent).collect();
        assert_eq!(percents, vec![10, 50, 100]);
        assert!(plan.is_last(2));
        assert!(!plan.is_last(1));
    }

    #[test]
    fn test_rejects_decreasing_sequence() {
        let err = RolloutPlan::percentages(&[50, 10, 100], 60).unwrap_err();
        assert!(matches!(err, CanaryflowError::Validation(_)));
    }

    #[test]
    fn test_rejects_plan_not_ending_at_full() {
        let err = RolloutPlan::percentages(&[10, 50], 60).unwrap_err();
        assert!(matches!(err, CanaryflowError::Validation(_)));
    }

    #[test]
    fn test_rejects_empty_plan() {
        let err = RolloutPlan::new(Vec::new()).unwrap_err();
        assert!(matches!(err, CanaryflowError::Validation(_)));
    }

    #[test]
    fn test_single_stage_plan() {
        let plan = RolloutPlan::percentages(&[100], 60).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.is_last(0));
    }

    #[test]
    fn test_non_decreasing_allows_repeats() {
        let plan = RolloutPlan::percentages(&[10, 50, 50, 100], 60).unwrap();
        assert_eq!(plan.len(), 4);
    }
}
