//! Stage controller — applies the change one canary stage at a time.

use crate::core::WorkflowExecution;
use crate::errors::CanaryflowError;
use crate::health::HealthVerdict;
use crate::ports::{ApplyResult, ChangeApplier};
use std::sync::Arc;
use tracing::{info, warn};

/// Returns the step name for a rollout stage action.
#[must_use]
pub(crate) fn stage_step_name(action: &str, index: u32, percent: u8) -> String {
    format!("{action}-stage-{index}-{percent}pct")
}

/// What the engine should do after a stage's monitoring window closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAdvance {
    /// The stage passed; apply the next stage.
    Continue {
        /// Index of the next stage to apply.
        next_index: u32,
    },
    /// The final stage passed; the rollout is complete.
    Done,
    /// The stage failed; roll back.
    Abort {
        /// Why the stage failed.
        reason: String,
    },
}

/// Owns the canary progression for in-flight workflows.
///
/// A stage is never re-applied once its apply step is completed in the
/// workflow's step log: resume after a crash re-enters the current
/// stage's monitoring window instead, to avoid double-application.
pub struct StageController {
    applier: Arc<dyn ChangeApplier>,
}

impl StageController {
    /// Creates a controller over the given applier.
    #[must_use]
    pub fn new(applier: Arc<dyn ChangeApplier>) -> Self {
        Self { applier }
    }

    /// Returns true if the current stage was already applied.
    ///
    /// Derived purely from the step log so the answer survives a crash.
    #[must_use]
    pub fn stage_already_applied(&self, execution: &WorkflowExecution) -> bool {
        let Some(percent) = execution.current_percent() else {
            return false;
        };
        execution.has_completed_step(&stage_step_name("apply", execution.stage_index, percent))
    }

    /// Applies the change at the current stage's percentage.
    ///
    /// Re-reads the target's configuration first: the target is a shared
    /// resource, and an out-of-band change is tolerated, not fatal — it
    /// is recorded in the step log and logged.
    ///
    /// # Errors
    ///
    /// Propagates applier failures as [`CanaryflowError::Apply`]; the
    /// caller must treat the target's state as unknown and roll back.
    pub async fn apply_current(
        &self,
        execution: &mut WorkflowExecution,
    ) -> Result<ApplyResult, CanaryflowError> {
        let stage = execution
            .plan
            .stage(execution.stage_index)
            .copied()
            .ok_or_else(|| CanaryflowError::InvalidTransition {
                workflow_id: execution.id,
                message: format!("no rollout stage at index {}", execution.stage_index),
            })?;

        let observed = self.applier.snapshot(&execution.target).await?;

        if let Some(expected) = self.last_observed_fingerprint(execution) {
            if expected != observed.fingerprint {
                warn!(
                    workflow = %execution.id,
                    target = %execution.target,
                    "target configuration changed out of band since last stage"
                );
            }
        }

        // Captured once, at rolling_out entry; later calls are no-ops.
        execution.capture_pre_change_snapshot(observed.clone());

        let step_name = stage_step_name("apply", execution.stage_index, stage.percent);
        execution.begin_step(
            step_name,
            Some(serde_json::json!({
                "percent": stage.percent,
                "observed_fingerprint": observed.fingerprint,
            })),
        );

        let result = match self
            .applier
            .apply(&execution.target, &execution.change, stage.percent)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                if let Some(step) = execution.last_step_mut() {
                    step.fail(err.to_string());
                }
                return Err(err);
            }
        };

        if let Some(step) = execution.last_step_mut() {
            step.complete(Some(serde_json::json!({
                "applied_percent": result.applied_percent,
                "observed_fingerprint": observed.fingerprint,
            })));
        }

        info!(
            workflow = %execution.id,
            target = %execution.target,
            percent = stage.percent,
            "applied canary stage"
        );
        Ok(result)
    }

    /// Folds a monitoring verdict into the progression.
    ///
    /// On a pass, increments the stage index (or reports completion at
    /// the final stage). On a fail, reports an abort with the reason.
    pub fn record_verdict(
        &self,
        execution: &mut WorkflowExecution,
        verdict: &HealthVerdict,
    ) -> StageAdvance {
        let index = execution.stage_index;
        let percent = execution.current_percent().unwrap_or(0);

        if !verdict.passed {
            let reason = verdict.failure_summary().unwrap_or_else(|| {
                format!("health verification failed at {percent}% (score {:.1})", verdict.score)
            });
            warn!(workflow = %execution.id, stage = index, %reason, "aborting rollout");
            return StageAdvance::Abort { reason };
        }

        if execution.plan.is_last(index) {
            info!(workflow = %execution.id, "final stage passed, rollout complete");
            return StageAdvance::Done;
        }

        execution.stage_index = index + 1;
        StageAdvance::Continue {
            next_index: execution.stage_index,
        }
    }

    /// Fingerprint observed at the most recent completed apply step.
    fn last_observed_fingerprint(&self, execution: &WorkflowExecution) -> Option<String> {
        execution
            .steps
            .iter()
            .rev()
            .filter(|s| s.name.starts_with("apply-stage-") && s.is_finished())
            .find_map(|s| {
                s.output
                    .as_ref()
                    .and_then(|o| o.get("observed_fingerprint"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            })
    }
}
