//! Error types for the canaryflow engine.
//!
//! The taxonomy separates input problems (never retried), data problems
//! (caller must resample), and state problems (surfaced as terminal so an
//! operator never mistakes a partially-applied change for a clean one).

use thiserror::Error;
use uuid::Uuid;

/// The main error type for canaryflow operations.
#[derive(Debug, Error)]
pub enum CanaryflowError {
    /// Bad input. Never retried, surfaced immediately.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A referenced entity does not exist.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// Baseline creation was attempted with too few samples.
    #[error("{0}")]
    InsufficientData(#[from] InsufficientDataError),

    /// A workflow parked in `awaiting_approval` expired.
    #[error("approval timed out for workflow {workflow_id} after {timeout_seconds}s")]
    ApprovalTimeout {
        /// The workflow that timed out.
        workflow_id: Uuid,
        /// The configured timeout in seconds.
        timeout_seconds: f64,
    },

    /// A stage application failed. The target's state is unknown, so this
    /// triggers an immediate rollback and is never retried.
    #[error("apply failed for target '{target}' at {percent}%: {reason}")]
    Apply {
        /// The target being changed.
        target: String,
        /// The stage percentage being applied.
        percent: u8,
        /// The failure reason reported by the applier.
        reason: String,
    },

    /// A checkpoint or baseline write failed. The causing transition is
    /// aborted and the workflow stays in its prior committed state.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Rollback itself failed. Terminal; requires operator action.
    #[error("rollback failed for workflow {workflow_id}: {reason}")]
    RollbackFailed {
        /// The workflow whose rollback failed.
        workflow_id: Uuid,
        /// The failure reason reported by the applier.
        reason: String,
    },

    /// The workflow was cancelled.
    #[error("workflow cancelled: {0}")]
    Cancelled(String),

    /// An attempted state transition is not allowed from the current status.
    #[error("invalid transition for workflow {workflow_id}: {message}")]
    InvalidTransition {
        /// The workflow involved.
        workflow_id: Uuid,
        /// What was attempted and why it is rejected.
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error raised when input validation fails.
#[derive(Debug, Clone, Error)]
#[error("validation failed: {message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The offending field, when known.
    pub field: Option<String>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Error raised when a workflow, checkpoint, or baseline is missing.
#[derive(Debug, Clone, Error)]
#[error("{entity} not found: {key}")]
pub struct NotFoundError {
    /// The entity kind (e.g. "workflow", "checkpoint", "baseline").
    pub entity: String,
    /// The lookup key.
    pub key: String,
}

impl NotFoundError {
    /// Creates a new not-found error.
    #[must_use]
    pub fn new(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// Creates a not-found error for a workflow id.
    #[must_use]
    pub fn workflow(id: Uuid) -> Self {
        Self::new("workflow", id.to_string())
    }

    /// Creates a not-found error for a checkpoint chain.
    #[must_use]
    pub fn checkpoint(workflow_id: Uuid) -> Self {
        Self::new("checkpoint", workflow_id.to_string())
    }
}

/// Error raised when a baseline is requested from too few samples.
#[derive(Debug, Clone, Error)]
#[error(
    "insufficient data for baseline on '{target}': got {got} samples, need at least {required}"
)]
pub struct InsufficientDataError {
    /// The target the baseline was requested for.
    pub target: String,
    /// The number of samples provided.
    pub got: usize,
    /// The minimum sample size required.
    pub required: usize,
}

impl InsufficientDataError {
    /// Creates a new insufficient-data error.
    #[must_use]
    pub fn new(target: impl Into<String>, got: usize, required: usize) -> Self {
        Self {
            target: target.into(),
            got,
            required,
        }
    }
}

impl CanaryflowError {
    /// Returns true if the error leaves the target's actual state unknown.
    ///
    /// These are never retried automatically.
    #[must_use]
    pub fn is_state_unsafe(&self) -> bool {
        matches!(self, Self::Apply { .. } | Self::RollbackFailed { .. })
    }

    /// Returns true if the error is transient and safe to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
