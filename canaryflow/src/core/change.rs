//! Change proposals and target references.

use crate::utils::{fingerprint_value, now_utc, shape_key, Timestamp};
use serde::{Deserialize, Serialize};

/// Reference to the external system being optimized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    /// Stable identifier of the target (e.g. a service or instance id).
    pub id: String,
    /// Target kind (e.g. "vm", "gpu-pool", "llm-deployment").
    pub kind: String,
}

impl TargetRef {
    /// Creates a new target reference.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// The dimension an optimization targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    /// Reduce spend.
    Cost,
    /// Improve throughput or latency.
    Performance,
    /// Right-size allocated resources.
    Resource,
    /// Improve output quality.
    Quality,
}

impl std::fmt::Display for OptimizationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cost => "cost",
            Self::Performance => "performance",
            Self::Resource => "resource",
            Self::Quality => "quality",
        };
        f.write_str(s)
    }
}

/// Risk classification of a proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Routine, easily reversible change.
    Low,
    /// Needs monitoring but auto-approvable.
    Medium,
    /// Always requires explicit approval.
    High,
}

/// Predicted effect of applying a change, used by the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EstimatedImpact {
    /// Estimated monthly cost delta (negative = savings).
    pub cost_delta: f64,
    /// Number of instances/replicas the change touches.
    pub affected_instances: u32,
}

impl EstimatedImpact {
    /// Creates a new impact estimate.
    #[must_use]
    pub fn new(cost_delta: f64, affected_instances: u32) -> Self {
        Self {
            cost_delta,
            affected_instances,
        }
    }
}

/// An externally-produced optimization proposal.
///
/// The engine never interprets `parameters`; they are passed opaquely to
/// the change applier at each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSpec {
    /// Human-readable summary of the change.
    pub description: String,
    /// The dimension being optimized.
    pub kind: OptimizationKind,
    /// Opaque change parameters handed to the applier.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Predicted effect, from the upstream analysis.
    pub estimated_impact: EstimatedImpact,
    /// Risk classification, from the upstream analysis.
    pub risk: RiskClass,
}

impl ChangeSpec {
    /// Creates a new change spec.
    #[must_use]
    pub fn new(description: impl Into<String>, kind: OptimizationKind) -> Self {
        Self {
            description: description.into(),
            kind,
            parameters: serde_json::Map::new(),
            estimated_impact: EstimatedImpact::default(),
            risk: RiskClass::Low,
        }
    }

    /// Adds a change parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Sets the impact estimate.
    #[must_use]
    pub fn with_estimated_impact(mut self, impact: EstimatedImpact) -> Self {
        self.estimated_impact = impact;
        self
    }

    /// Sets the risk class.
    #[must_use]
    pub fn with_risk(mut self, risk: RiskClass) -> Self {
        self.risk = risk;
        self
    }

    /// Returns true if the spec carries no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Returns the shape key used to group learning outcomes.
    #[must_use]
    pub fn shape_key(&self) -> String {
        shape_key(&self.kind.to_string(), &self.parameters)
    }
}

/// An immutable snapshot of a target's configuration.
///
/// Captured once when a rollout begins and used verbatim by the rollback
/// manager; never overwritten afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// The raw configuration document.
    pub config: serde_json::Value,
    /// Stable fingerprint of `config`.
    pub fingerprint: String,
    /// When the snapshot was captured.
    pub captured_at: Timestamp,
}

impl ConfigSnapshot {
    /// Captures a snapshot of the given configuration document.
    #[must_use]
    pub fn capture(config: serde_json::Value) -> Self {
        let fingerprint = fingerprint_value(&config);
        Self {
            config,
            fingerprint,
            captured_at: now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_ref_display() {
        let target = TargetRef::new("web-01", "vm");
        assert_eq!(target.to_string(), "vm/web-01");
    }

    #[test]
    fn test_change_spec_builder() {
        let change = ChangeSpec::new("resize to m5.large", OptimizationKind::Cost)
            .with_parameter("instance_type", serde_json::json!("m5.large"))
            .with_estimated_impact(EstimatedImpact::new(-120.0, 4))
            .with_risk(RiskClass::Medium);

        assert!(!change.is_empty());
        assert_eq!(change.risk, RiskClass::Medium);
        assert!(change.estimated_impact.cost_delta < 0.0);
    }

    #[test]
    fn test_shape_key_stable_across_values() {
        let a = ChangeSpec::new("a", OptimizationKind::Cost)
            .with_parameter("instance_type", serde_json::json!("m5.large"));
        let b = ChangeSpec::new("b", OptimizationKind::Cost)
            .with_parameter("instance_type", serde_json::json!("c6i.xlarge"));
        assert_eq!(a.shape_key(), b.shape_key());
    }

    #[test]
    fn test_config_snapshot_fingerprint() {
        let snap = ConfigSnapshot::capture(serde_json::json!({"cpu": 4, "mem": 16}));
        let same = ConfigSnapshot::capture(serde_json::json!({"mem": 16, "cpu": 4}));
        assert_eq!(snap.fingerprint, same.fingerprint);
    }

    #[test]
    fn test_risk_class_ordering() {
        assert!(RiskClass::High > RiskClass::Medium);
        assert!(RiskClass::Medium > RiskClass::Low);
    }
}
