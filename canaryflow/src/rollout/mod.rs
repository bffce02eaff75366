//! Graduated canary rollout: plan and stage controller.

mod controller;
mod plan;

pub(crate) use controller::stage_step_name;
pub use controller::{StageAdvance, StageController};
pub use plan::{RolloutPlan, RolloutStage};
