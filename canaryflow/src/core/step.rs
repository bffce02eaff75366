//! Workflow steps: the append-only audit trail of a workflow execution.

use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// Status of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Created but not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Skipped (e.g. approval skipped by auto-approve).
    Skipped,
    /// Being retried after a transient failure.
    Retrying,
}

/// One step in a workflow execution's history.
///
/// Steps are created by the engine when it enters a stage, mutated only
/// by the engine, and never deleted. A step cannot return to `pending`
/// once it has left it; `retrying` is the only loop, bounded by
/// `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step name (e.g. "apply-stage-50").
    pub name: String,
    /// Zero-based position in the execution's step log.
    pub index: u32,
    /// Current status.
    pub status: StepStatus,
    /// Number of retries consumed so far.
    pub retry_count: u32,
    /// Upper bound on retries.
    pub max_retries: u32,
    /// Input payload recorded when the step started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Output payload recorded when the step finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the step was created.
    pub started_at: Timestamp,
    /// When the step reached a final status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

impl WorkflowStep {
    /// Creates a new running step at the given index.
    #[must_use]
    pub fn running(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            status: StepStatus::Running,
            retry_count: 0,
            max_retries: 3,
            input: None,
            output: None,
            error: None,
            started_at: now_utc(),
            completed_at: None,
        }
    }

    /// Sets the input payload.
    #[must_use]
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Sets the retry bound.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Marks the step completed with an optional output payload.
    pub fn complete(&mut self, output: Option<serde_json::Value>) {
        self.status = StepStatus::Completed;
        self.output = output;
        self.completed_at = Some(now_utc());
    }

    /// Marks the step failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now_utc());
    }

    /// Marks the step skipped with a reason recorded as output.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.output = Some(serde_json::json!({ "skip_reason": reason.into() }));
        self.completed_at = Some(now_utc());
    }

    /// Consumes one retry. Returns false when retries are exhausted.
    pub fn try_retry(&mut self) -> bool {
        if self.retry_count >= self.max_retries {
            return false;
        }
        self.retry_count += 1;
        self.status = StepStatus::Retrying;
        true
    }

    /// Returns true if the step has reached a final status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}
