//! Structured events emitted by the workflow engine.

use crate::regression::RegressionAlert;
use serde::Serialize;
use uuid::Uuid;

/// An event describing workflow progress.
///
/// Every transition the engine commits is mirrored by one of these, so
/// hosts can wire up alerting or audit feeds without polling `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    /// A workflow was created and its initial state committed.
    #[serde(rename = "workflow.created")]
    WorkflowCreated {
        /// The workflow's id.
        workflow_id: Uuid,
    },
    /// A workflow left `pending` and began analysis.
    #[serde(rename = "workflow.started")]
    WorkflowStarted {
        /// The workflow's id.
        workflow_id: Uuid,
    },
    /// The approval gate parked the workflow in `awaiting_approval`.
    #[serde(rename = "workflow.approval_required")]
    ApprovalRequired {
        /// The workflow's id.
        workflow_id: Uuid,
        /// Why the gate blocked auto-approval.
        reason: String,
    },
    /// An operator approved the change.
    #[serde(rename = "workflow.approved")]
    WorkflowApproved {
        /// The workflow's id.
        workflow_id: Uuid,
    },
    /// An operator rejected the change.
    #[serde(rename = "workflow.rejected")]
    WorkflowRejected {
        /// The workflow's id.
        workflow_id: Uuid,
        /// The operator's stated reason.
        reason: String,
    },
    /// A canary stage was applied to the target.
    #[serde(rename = "stage.applied")]
    StageApplied {
        /// The workflow's id.
        workflow_id: Uuid,
        /// Index of the applied stage.
        stage: u32,
        /// Percentage the change now covers.
        percent: u8,
    },
    /// A stage's monitoring window passed.
    #[serde(rename = "stage.passed")]
    StagePassed {
        /// The workflow's id.
        workflow_id: Uuid,
        /// Index of the stage about to be applied.
        next_stage: u32,
        /// Aggregate health score over the window.
        score: f64,
    },
    /// A stage failed to apply or failed its monitoring window.
    #[serde(rename = "stage.failed")]
    StageFailed {
        /// The workflow's id.
        workflow_id: Uuid,
        /// Index of the failed stage.
        stage: u32,
        /// What went wrong.
        reason: String,
    },
    /// All stages passed; the change is fully applied.
    #[serde(rename = "workflow.succeeded")]
    WorkflowSucceeded {
        /// The workflow's id.
        workflow_id: Uuid,
    },
    /// The target was reverted after an aborted rollout.
    #[serde(rename = "workflow.rolled_back")]
    WorkflowRolledBack {
        /// The workflow's id.
        workflow_id: Uuid,
        /// Why the rollout was aborted.
        reason: String,
    },
    /// The workflow failed terminally.
    #[serde(rename = "workflow.failed")]
    WorkflowFailed {
        /// The workflow's id.
        workflow_id: Uuid,
        /// Failure description, when one was recorded.
        reason: Option<String>,
    },
    /// The workflow was cancelled by an operator.
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled {
        /// The workflow's id.
        workflow_id: Uuid,
        /// The operator's stated reason.
        reason: String,
    },
    /// The approval window expired before an operator acted.
    #[serde(rename = "workflow.timeout")]
    WorkflowTimeout {
        /// The workflow's id.
        workflow_id: Uuid,
    },
    /// A regression was detected against the target's baseline.
    #[serde(rename = "regression.alert")]
    RegressionAlert {
        /// The recorded alert.
        alert: RegressionAlert,
    },
}

impl EngineEvent {
    /// The event's dotted kind tag, e.g. `stage.applied`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowCreated { .. } => "workflow.created",
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::ApprovalRequired { .. } => "workflow.approval_required",
            Self::WorkflowApproved { .. } => "workflow.approved",
            Self::WorkflowRejected { .. } => "workflow.rejected",
            Self::StageApplied { .. } => "stage.applied",
            Self::StagePassed { .. } => "stage.passed",
            Self::StageFailed { .. } => "stage.failed",
            Self::WorkflowSucceeded { .. } => "workflow.succeeded",
            Self::WorkflowRolledBack { .. } => "workflow.rolled_back",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowCancelled { .. } => "workflow.cancelled",
            Self::WorkflowTimeout { .. } => "workflow.timeout",
            Self::RegressionAlert { .. } => "regression.alert",
        }
    }

    /// The id of the workflow the event concerns, if any.
    #[must_use]
    pub fn workflow_id(&self) -> Option<Uuid> {
        match self {
            Self::WorkflowCreated { workflow_id }
            | Self::WorkflowStarted { workflow_id }
            | Self::ApprovalRequired { workflow_id, .. }
            | Self::WorkflowApproved { workflow_id }
            | Self::WorkflowRejected { workflow_id, .. }
            | Self::StageApplied { workflow_id, .. }
            | Self::StagePassed { workflow_id, .. }
            | Self::StageFailed { workflow_id, .. }
            | Self::WorkflowSucceeded { workflow_id }
            | Self::WorkflowRolledBack { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id, .. }
            | Self::WorkflowTimeout { workflow_id } => Some(*workflow_id),
            Self::RegressionAlert { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_uuid;

    #[test]
    fn test_kind_matches_serialized_tag() {
        let id = generate_uuid();
        let event = EngineEvent::StageApplied {
            workflow_id: id,
            stage: 1,
            percent: 50,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.kind());
        assert_eq!(json["percent"], 50);
    }

    #[test]
    fn test_workflow_id_extraction() {
        let id = generate_uuid();
        let event = EngineEvent::WorkflowSucceeded { workflow_id: id };
        assert_eq!(event.workflow_id(), Some(id));
    }
}
