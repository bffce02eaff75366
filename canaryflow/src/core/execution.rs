//! Workflow execution records and the status state machine.

use super::{ChangeSpec, ConfigSnapshot, TargetRef, WorkflowStep};
use crate::errors::CanaryflowError;
use crate::rollout::RolloutPlan;
use crate::utils::{generate_uuid, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet started.
    Pending,
    /// Validating the target and capturing its current state.
    Analyzing,
    /// Estimating impact and consulting the approval gate.
    Recommending,
    /// Parked until an operator approves or rejects.
    AwaitingApproval,
    /// Applying the change at the current canary stage.
    RollingOut,
    /// Watching live metrics for the current stage's window.
    Monitoring,
    /// All stages passed; the change is fully applied.
    Succeeded,
    /// Reverting to the pre-change configuration.
    RollingBack,
    /// Reverted; the pre-change configuration is restored.
    RolledBack,
    /// Terminal failure (validation, apply, reject, or rollback failure).
    Failed,
    /// Cancelled by an operator.
    Cancelled,
    /// The approval window expired.
    Timeout,
}

impl WorkflowStatus {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::RolledBack | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Returns the statuses this one may legally transition to.
    #[must_use]
    pub fn allowed_next(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Analyzing, Self::Cancelled, Self::Failed],
            Self::Analyzing => &[Self::Recommending, Self::Cancelled, Self::Failed],
            Self::Recommending => &[
                Self::AwaitingApproval,
                Self::RollingOut,
                Self::Cancelled,
                Self::Failed,
            ],
            Self::AwaitingApproval => &[
                Self::RollingOut,
                Self::Failed,
                Self::Timeout,
                Self::Cancelled,
            ],
            Self::RollingOut => &[
                Self::Monitoring,
                Self::RollingBack,
                Self::Cancelled,
                Self::Failed,
            ],
            Self::Monitoring => &[
                Self::RollingOut,
                Self::Succeeded,
                Self::RollingBack,
                Self::Cancelled,
            ],
            Self::RollingBack => &[Self::RolledBack, Self::Failed, Self::Cancelled],
            Self::Succeeded
            | Self::RolledBack
            | Self::Failed
            | Self::Cancelled
            | Self::Timeout => &[],
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Recommending => "recommending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::RollingOut => "rolling_out",
            Self::Monitoring => "monitoring",
            Self::Succeeded => "succeeded",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Error detail attached to a failed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable failure description.
    pub message: String,
    /// True when a rollback attempt itself failed; the target may be in
    /// a partially-applied state and needs operator intervention.
    #[serde(default)]
    pub rollback_failed: bool,
}

impl ErrorDetail {
    /// Creates a new error detail.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            rollback_failed: false,
        }
    }

    /// Marks the failure as a rollback failure.
    #[must_use]
    pub fn rollback_failed(mut self) -> Self {
        self.rollback_failed = true;
        self
    }
}

/// An opaque output attached to an execution (e.g. a health report).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact id.
    pub id: Uuid,
    /// Artifact name (e.g. "health-report").
    pub name: String,
    /// Artifact kind tag.
    pub kind: String,
    /// The artifact payload.
    pub data: serde_json::Value,
    /// When the artifact was recorded.
    pub created_at: Timestamp,
}

impl Artifact {
    /// Creates a new artifact.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: generate_uuid(),
            name: name.into(),
            kind: kind.into(),
            data,
            created_at: now_utc(),
        }
    }
}

/// A single workflow execution: one proposed change moving through the
/// staged rollout state machine.
///
/// The engine exclusively owns the lifecycle of this record. Steps are
/// append-only; checkpoints serialize the whole record so resume after a
/// crash is exact, including the current stage index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Workflow id.
    pub id: Uuid,
    /// The target being optimized.
    pub target: TargetRef,
    /// Current status.
    pub status: WorkflowStatus,
    /// The proposed change (input payload).
    pub change: ChangeSpec,
    /// The canary progression this execution follows.
    pub plan: RolloutPlan,
    /// Index of the current rollout stage.
    pub stage_index: u32,
    /// Target configuration captured at `rolling_out` entry, used by the
    /// rollback manager. Written once, never overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_change_snapshot: Option<ConfigSnapshot>,
    /// Output payload, set at terminal states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error detail for failed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Ordered step log (audit trail).
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Artifacts produced during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// When the execution record was created.
    pub created_at: Timestamp,
    /// When the execution left `pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Deadline for the approval window, when one was configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_deadline: Option<Timestamp>,
}

impl WorkflowExecution {
    /// Creates a new pending execution.
    #[must_use]
    pub fn new(target: TargetRef, change: ChangeSpec, plan: RolloutPlan) -> Self {
        Self {
            id: generate_uuid(),
            target,
            status: WorkflowStatus::Pending,
            change,
            plan,
            stage_index: 0,
            pre_change_snapshot: None,
            output: None,
            error: None,
            steps: Vec::new(),
            artifacts: Vec::new(),
            created_at: now_utc(),
            started_at: None,
            completed_at: None,
            approval_deadline: None,
        }
    }

    /// Transitions to a new status, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the move is not allowed from the
    /// current status.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), CanaryflowError> {
        if !self.status.allowed_next().contains(&next) {
            return Err(CanaryflowError::InvalidTransition {
                workflow_id: self.id,
                message: format!("{} -> {} is not allowed", self.status, next),
            });
        }

        if self.status == WorkflowStatus::Pending {
            self.started_at = Some(now_utc());
        }
        if next.is_terminal() {
            self.completed_at = Some(now_utc());
        }
        self.status = next;
        Ok(())
    }

    /// Appends a running step and returns its index.
    pub fn begin_step(&mut self, name: impl Into<String>, input: Option<serde_json::Value>) -> u32 {
        let index = u32::try_from(self.steps.len()).unwrap_or(u32::MAX);
        let mut step = WorkflowStep::running(name, index);
        step.input = input;
        self.steps.push(step);
        index
    }

    /// Returns a mutable reference to the most recent step.
    pub fn last_step_mut(&mut self) -> Option<&mut WorkflowStep> {
        self.steps.last_mut()
    }

    /// Returns true if a step with the given name completed.
    ///
    /// Used on resume to decide whether a stage was already applied, so
    /// it is never applied twice.
    #[must_use]
    pub fn has_completed_step(&self, name: &str) -> bool {
        self.steps
            .iter()
            .any(|s| s.name == name && s.status == super::StepStatus::Completed)
    }

    /// Records an artifact on the execution.
    pub fn record_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    /// Records the pre-change snapshot, once. Later calls are ignored.
    pub fn capture_pre_change_snapshot(&mut self, snapshot: ConfigSnapshot) {
        if self.pre_change_snapshot.is_none() {
            self.pre_change_snapshot = Some(snapshot);
        }
    }

    /// Returns the percentage of the current rollout stage, if any.
    #[must_use]
    pub fn current_percent(&self) -> Option<u8> {
        self.plan
            .stage(self.stage_index)
            .map(|stage| stage.percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OptimizationKind;

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new(
            TargetRef::new("web-01", "vm"),
            ChangeSpec::new("resize", OptimizationKind::Cost)
                .with_parameter("instance_type", serde_json::json!("m5.large")),
            RolloutPlan::default(),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut exec = execution();
        for next in [
            WorkflowStatus::Analyzing,
            WorkflowStatus::Recommending,
            WorkflowStatus::RollingOut,
            WorkflowStatus::Monitoring,
            WorkflowStatus::Succeeded,
        ] {
            exec.transition(next).unwrap();
        }
        assert!(exec.status.is_terminal());
        assert!(exec.started_at.is_some());
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut exec = execution();
        let err = exec.transition(WorkflowStatus::Monitoring).unwrap_err();
        assert!(matches!(err, CanaryflowError::InvalidTransition { .. }));
        assert_eq!(exec.status, WorkflowStatus::Pending);
    }

    #[test]
    fn test_cancel_is_reachable_from_every_non_terminal_status() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Analyzing,
            WorkflowStatus::Recommending,
            WorkflowStatus::AwaitingApproval,
            WorkflowStatus::RollingOut,
            WorkflowStatus::Monitoring,
            WorkflowStatus::RollingBack,
        ] {
            assert!(
                status.allowed_next().contains(&WorkflowStatus::Cancelled),
                "{status} must allow cancellation"
            );
        }
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        let mut exec = execution();
        exec.transition(WorkflowStatus::Cancelled).unwrap();
        assert!(exec.transition(WorkflowStatus::Analyzing).is_err());
    }

    #[test]
    fn test_step_indexes_are_unique_and_monotonic() {
        let mut exec = execution();
        let a = exec.begin_step("analyze", None);
        let b = exec.begin_step("recommend", None);
        let c = exec.begin_step("apply-stage-10", None);
        assert_eq!((a, b, c), (0, 1, 2));

        let indexes: Vec<u32> = exec.steps.iter().map(|s| s.index).collect();
        let mut sorted = indexes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(indexes, sorted);
    }

    #[test]
    fn test_pre_change_snapshot_write_once() {
        let mut exec = execution();
        exec.capture_pre_change_snapshot(ConfigSnapshot::capture(serde_json::json!({"cpu": 4})));
        let first = exec.pre_change_snapshot.clone().unwrap();

        exec.capture_pre_change_snapshot(ConfigSnapshot::capture(serde_json::json!({"cpu": 8})));
        assert_eq!(
            exec.pre_change_snapshot.unwrap().fingerprint,
            first.fingerprint
        );
    }

    #[test]
    fn test_serialization_roundtrip_preserves_stage_index() {
        let mut exec = execution();
        exec.stage_index = 1;
        let json = serde_json::to_string(&exec).unwrap();
        let back: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stage_index, 1);
        assert_eq!(back.target, exec.target);
    }
}
