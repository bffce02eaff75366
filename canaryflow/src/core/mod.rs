//! Core domain model: workflow executions, steps, and change specs.

mod change;
mod execution;
mod step;

pub use change::{
    ChangeSpec, ConfigSnapshot, EstimatedImpact, OptimizationKind, RiskClass, TargetRef,
};
pub use execution::{Artifact, ErrorDetail, WorkflowExecution, WorkflowStatus};
pub use step::{StepStatus, WorkflowStep};
