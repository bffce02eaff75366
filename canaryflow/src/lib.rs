//! # Canaryflow
//!
//! A staged optimization workflow engine.
//!
//! Canaryflow takes an externally-produced optimization proposal and
//! drives it through a persistent state machine:
//!
//! - **Graduated rollout**: changes are applied one canary stage at a
//!   time (10% / 50% / 100% by default), never all at once
//! - **Statistical gating**: each stage is monitored against a baseline;
//!   regressions are graded and severe ones abort the stage early
//! - **Checkpointed state**: every transition is committed by appending
//!   a checkpoint, so a crashed workflow resumes exactly where it left
//!   off without re-applying a committed stage
//! - **Approval gating**: high-impact changes park in `awaiting_approval`
//!   as persisted state until an operator approves or rejects
//! - **Automatic rollback**: failed or cancelled rollouts revert the
//!   target to its pre-change configuration
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use canaryflow::prelude::*;
//!
//! let engine = WorkflowEngine::builder(applier, collector).build();
//!
//! let change = ChangeSpec::new("resize to m5.large", OptimizationKind::Cost)
//!     .with_parameter("instance_type", serde_json::json!("m5.large"));
//!
//! let id = engine.start(TargetRef::new("web-01", "vm"), change, None).await?;
//! let result = engine.run(id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod approval;
pub mod baseline;
pub mod cancellation;
pub mod checkpoint;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod health;
pub mod learning;
pub mod ports;
pub mod regression;
pub mod rollback;
pub mod rollout;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalPolicy};
    pub use crate::baseline::{Baseline, BaselineStatus, BaselineStore, InMemoryBaselineStore};
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
    pub use crate::core::{
        Artifact, ChangeSpec, ConfigSnapshot, ErrorDetail, EstimatedImpact, OptimizationKind,
        RiskClass, StepStatus, TargetRef, WorkflowExecution, WorkflowStatus, WorkflowStep,
    };
    pub use crate::engine::{EngineConfig, RetryConfig, WorkflowEngine, WorkflowEngineBuilder};
    pub use crate::errors::{
        CanaryflowError, InsufficientDataError, NotFoundError, ValidationError,
    };
    pub use crate::events::{
        CollectingEventSink, EngineEvent, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::health::{HealthConfig, HealthMonitor, HealthVerdict, HealthWeights};
    pub use crate::learning::{InMemoryLearningRecorder, LearningRecorder, OutcomeRecord};
    pub use crate::ports::{
        ApplyResult, ChangeApplier, MetricSnapshot, MetricsCollector, RevertResult,
    };
    pub use crate::regression::{
        RegressionAlert, RegressionDetector, RegressionResult, RegressionSeverity,
        RegressionThresholds,
    };
    pub use crate::rollback::{RollbackManager, RollbackResult};
    pub use crate::rollout::{RolloutPlan, RolloutStage, StageAdvance, StageController};
}
