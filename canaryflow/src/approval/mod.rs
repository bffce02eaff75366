//! Approval gating policy.
//!
//! The gate decides whether a proposed change may roll out automatically
//! or must park in `awaiting_approval` until an operator acts. The wait
//! itself is persisted workflow state, not an in-process suspension:
//! `approve`/`reject` on the engine are the only external mutators.

use crate::core::{ChangeSpec, RiskClass};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy inputs for the approval decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Absolute monthly cost delta above which approval is required.
    pub cost_threshold: f64,
    /// Instance count above which approval is required.
    pub instance_threshold: u32,
    /// Optional bound on how long a workflow may park in
    /// `awaiting_approval` before transitioning to `timeout`.
    /// No timeout by default.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_secs_opt")]
    pub approval_timeout: Option<Duration>,
}

/// Serializes an optional `Duration` as fractional seconds.
mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.map(Duration::from_secs_f64))
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            cost_threshold: 500.0,
            instance_threshold: 20,
            approval_timeout: None,
        }
    }
}

impl ApprovalPolicy {
    /// Creates a new policy with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cost threshold.
    #[must_use]
    pub fn with_cost_threshold(mut self, threshold: f64) -> Self {
        self.cost_threshold = threshold;
        self
    }

    /// Sets the instance threshold.
    #[must_use]
    pub fn with_instance_threshold(mut self, threshold: u32) -> Self {
        self.instance_threshold = threshold;
        self
    }

    /// Sets the approval timeout.
    #[must_use]
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }
}

/// Outcome of the approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum ApprovalDecision {
    /// The change may proceed without operator action.
    Approved {
        /// Why auto-approval applied.
        reason: String,
    },
    /// The workflow must park until an operator approves or rejects.
    RequiresApproval {
        /// Why the gate blocked.
        reason: String,
    },
}

impl ApprovalDecision {
    /// Returns true for auto-approval.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// Applies the approval policy to a proposed change.
#[derive(Debug, Clone, Default)]
pub struct ApprovalGate {
    policy: ApprovalPolicy,
}

impl ApprovalGate {
    /// Creates a gate with the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gate with a specific policy.
    #[must_use]
    pub fn with_policy(policy: ApprovalPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy in use.
    #[must_use]
    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Decides whether the change may proceed automatically.
    ///
    /// `impact_bias` scales the estimated cost delta using historical
    /// actual-vs-estimated ratios from the learning recorder, so a shape
    /// of change that routinely lands bigger than estimated is gated
    /// more conservatively.
    #[must_use]
    pub fn decide(&self, change: &ChangeSpec, impact_bias: Option<f64>) -> ApprovalDecision {
        if change.risk == RiskClass::High {
            return ApprovalDecision::RequiresApproval {
                reason: "risk class is high".to_string(),
            };
        }

        let bias = impact_bias.unwrap_or(1.0).max(1.0);
        let effective_cost = change.estimated_impact.cost_delta.abs() * bias;

        if effective_cost > self.policy.cost_threshold {
            return ApprovalDecision::RequiresApproval {
                reason: format!(
                    "estimated cost impact {effective_cost:.2} exceeds threshold {:.2}",
                    self.policy.cost_threshold
                ),
            };
        }

        if change.estimated_impact.affected_instances > self.policy.instance_threshold {
            return ApprovalDecision::RequiresApproval {
                reason: format!(
                    "{} affected instances exceeds threshold {}",
                    change.estimated_impact.affected_instances, self.policy.instance_threshold
                ),
            };
        }

        ApprovalDecision::Approved {
            reason: "impact and risk within auto-approval policy".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EstimatedImpact, OptimizationKind};

    fn change(cost_delta: f64, instances: u32, risk: RiskClass) -> ChangeSpec {
        ChangeSpec::new("resize", OptimizationKind::Cost)
            .with_parameter("instance_type", serde_json::json!("m5.large"))
            .with_estimated_impact(EstimatedImpact::new(cost_delta, instances))
            .with_risk(risk)
    }

    #[test]
    fn test_low_risk_small_impact_auto_approves() {
        let gate = ApprovalGate::new();
        let decision = gate.decide(&change(-100.0, 3, RiskClass::Low), None);
        assert!(decision.is_approved());
    }

    #[test]
    fn test_high_risk_always_blocks() {
        let gate = ApprovalGate::new();
        let decision = gate.decide(&change(-1.0, 1, RiskClass::High), None);
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_cost_above_threshold_blocks() {
        let gate = ApprovalGate::with_policy(ApprovalPolicy::new().with_cost_threshold(200.0));
        let decision = gate.decide(&change(-250.0, 3, RiskClass::Low), None);
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_instance_count_above_threshold_blocks() {
        let gate = ApprovalGate::with_policy(ApprovalPolicy::new().with_instance_threshold(5));
        let decision = gate.decide(&change(-10.0, 6, RiskClass::Medium), None);
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_impact_bias_tightens_gate() {
        let gate = ApprovalGate::with_policy(ApprovalPolicy::new().with_cost_threshold(200.0));
        let c = change(-150.0, 3, RiskClass::Low);

        assert!(gate.decide(&c, None).is_approved());
        // History says this shape lands at ~2x its estimate.
        assert!(!gate.decide(&c, Some(2.0)).is_approved());
        // A favorable bias never loosens the gate below the raw estimate.
        assert!(gate.decide(&c, Some(0.5)).is_approved());
    }

    #[test]
    fn test_policy_serializes_with_timeout() {
        let policy = ApprovalPolicy::new().with_approval_timeout(Duration::from_secs(3600));
        let json = serde_json::to_string(&policy).unwrap();
        let back: ApprovalPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.approval_timeout, Some(Duration::from_secs(3600)));
    }
}
