//! Rollback: reverting a target to its pre-change configuration.

use crate::core::WorkflowExecution;
use crate::errors::CanaryflowError;
use crate::ports::ChangeApplier;
use crate::utils::{now_utc, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Result of a rollback request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    /// The workflow that was rolled back.
    pub workflow_id: Uuid,
    /// True when a revert action was performed (or was already
    /// performed by a prior call).
    pub reverted: bool,
    /// Fingerprint of the restored configuration, when reverted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_fingerprint: Option<String>,
    /// Why the rollback was requested.
    pub reason: String,
    /// When the rollback completed.
    pub completed_at: Timestamp,
}

/// Reverts in-flight or completed changes.
///
/// Rollback is idempotent: a second call for the same workflow returns
/// the first call's result and performs the revert action at most once.
/// Rollback failures are terminal and never retried automatically —
/// retrying an unknown-state revert is unsafe, so they are surfaced for
/// operator intervention instead.
pub struct RollbackManager {
    applier: Arc<dyn ChangeApplier>,
    results: Mutex<HashMap<Uuid, RollbackResult>>,
}

impl RollbackManager {
    /// Creates a manager over the given applier.
    #[must_use]
    pub fn new(applier: Arc<dyn ChangeApplier>) -> Self {
        Self {
            applier,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Reverts the target to the execution's pre-change snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CanaryflowError::RollbackFailed`] when the revert
    /// action fails; the target's state is then unknown.
    pub async fn rollback(
        &self,
        execution: &WorkflowExecution,
        reason: impl Into<String>,
    ) -> Result<RollbackResult, CanaryflowError> {
        let reason = reason.into();

        if let Some(prior) = self.results.lock().get(&execution.id) {
            info!(workflow = %execution.id, "rollback already performed, returning prior result");
            return Ok(prior.clone());
        }

        let Some(snapshot) = execution.pre_change_snapshot.as_ref() else {
            // Nothing was ever applied; record a no-op so repeat calls
            // stay idempotent.
            let result = RollbackResult {
                workflow_id: execution.id,
                reverted: false,
                restored_fingerprint: None,
                reason,
                completed_at: now_utc(),
            };
            self.results.lock().insert(execution.id, result.clone());
            return Ok(result);
        };

        match self.applier.revert(&execution.target, snapshot).await {
            Ok(revert) => {
                let result = RollbackResult {
                    workflow_id: execution.id,
                    reverted: true,
                    restored_fingerprint: Some(revert.restored_fingerprint),
                    reason,
                    completed_at: now_utc(),
                };
                self.results.lock().insert(execution.id, result.clone());
                info!(workflow = %execution.id, target = %execution.target, "rollback complete");
                Ok(result)
            }
            Err(err) => {
                error!(
                    workflow = %execution.id,
                    target = %execution.target,
                    error = %err,
                    "rollback failed; operator intervention required"
                );
                Err(CanaryflowError::RollbackFailed {
                    workflow_id: execution.id,
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeSpec, ConfigSnapshot, OptimizationKind, TargetRef};
    use crate::rollout::RolloutPlan;
    use crate::testing::MockChangeApplier;

    fn execution_with_snapshot() -> WorkflowExecution {
        let mut exec = WorkflowExecution::new(
            TargetRef::new("web-01", "vm"),
            ChangeSpec::new("resize", OptimizationKind::Cost)
                .with_parameter("instance_type", serde_json::json!("m5.large")),
            RolloutPlan::default(),
        );
        exec.capture_pre_change_snapshot(ConfigSnapshot::capture(serde_json::json!({"cpu": 4})));
        exec
    }

    #[tokio::test]
    async fn test_rollback_reverts_to_snapshot() {
        let applier = Arc::new(MockChangeApplier::new(serde_json::json!({"cpu": 4})));
        let manager = RollbackManager::new(applier.clone());
        let exec = execution_with_snapshot();

        let result = manager.rollback(&exec, "health gate failed").await.unwrap();
        assert!(result.reverted);
        assert_eq!(
            result.restored_fingerprint.as_deref(),
            Some(exec.pre_change_snapshot.as_ref().unwrap().fingerprint.as_str())
        );
        assert_eq!(applier.revert_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_twice_reverts_at_most_once() {
        let applier = Arc::new(MockChangeApplier::new(serde_json::json!({"cpu": 4})));
        let manager = RollbackManager::new(applier.clone());
        let exec = execution_with_snapshot();

        let first = manager.rollback(&exec, "first").await.unwrap();
        let second = manager.rollback(&exec, "second").await.unwrap();

        assert_eq!(first.reason, second.reason);
        assert_eq!(first.completed_at, second.completed_at);
        assert_eq!(applier.revert_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_is_noop() {
        let applier = Arc::new(MockChangeApplier::new(serde_json::json!({"cpu": 4})));
        let manager = RollbackManager::new(applier.clone());
        let exec = WorkflowExecution::new(
            TargetRef::new("web-01", "vm"),
            ChangeSpec::new("resize", OptimizationKind::Cost),
            RolloutPlan::default(),
        );

        let result = manager.rollback(&exec, "cancelled early").await.unwrap();
        assert!(!result.reverted);
        assert_eq!(applier.revert_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_is_surfaced_not_cached() {
        let applier =
            Arc::new(MockChangeApplier::new(serde_json::json!({"cpu": 4})).fail_revert());
        let manager = RollbackManager::new(applier.clone());
        let exec = execution_with_snapshot();

        let err = manager.rollback(&exec, "abort").await.unwrap_err();
        assert!(matches!(err, CanaryflowError::RollbackFailed { .. }));

        // A later manual retry is still possible; failures are not cached.
        let err = manager.rollback(&exec, "abort").await.unwrap_err();
        assert!(matches!(err, CanaryflowError::RollbackFailed { .. }));
    }
}
