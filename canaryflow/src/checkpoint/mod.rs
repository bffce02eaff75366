//! Durable checkpoints for crash-safe workflow resume.
//!
//! Checkpoints are append-only. Each one carries its parent's id, so a
//! workflow's checkpoints form a chain; the latest entry is the
//! authoritative resumable state. The store never interprets the
//! serialized state it holds.

use crate::core::WorkflowExecution;
use crate::errors::{CanaryflowError, NotFoundError};
use crate::utils::{generate_uuid, now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A durable snapshot of a workflow's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The workflow this checkpoint belongs to.
    pub workflow_id: Uuid,
    /// This checkpoint's id.
    pub checkpoint_id: Uuid,
    /// The previous checkpoint in the chain, if any.
    pub parent_id: Option<Uuid>,
    /// Serialized workflow execution.
    pub state: serde_json::Value,
    /// When the checkpoint was written.
    pub created_at: Timestamp,
}

impl Checkpoint {
    /// Builds a checkpoint from an execution, chained to a parent.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the execution cannot be encoded.
    pub fn from_execution(
        execution: &WorkflowExecution,
        parent_id: Option<Uuid>,
    ) -> Result<Self, CanaryflowError> {
        Ok(Self {
            workflow_id: execution.id,
            checkpoint_id: generate_uuid(),
            parent_id,
            state: serde_json::to_value(execution)?,
            created_at: now_utc(),
        })
    }

    /// Decodes the execution stored in this checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the state cannot be decoded.
    pub fn to_execution(&self) -> Result<WorkflowExecution, CanaryflowError> {
        Ok(serde_json::from_value(self.state.clone())?)
    }
}

/// Storage backend for workflow checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Appends a checkpoint to a workflow's chain.
    ///
    /// The write must be durable before this returns: the engine treats
    /// a successful append as the commit point of a state transition.
    async fn append(&self, checkpoint: Checkpoint) -> Result<(), CanaryflowError>;

    /// Returns the latest checkpoint for a workflow, if any.
    async fn latest(&self, workflow_id: Uuid) -> Result<Option<Checkpoint>, CanaryflowError>;

    /// Returns a workflow's full checkpoint chain, oldest first.
    async fn chain(&self, workflow_id: Uuid) -> Result<Vec<Checkpoint>, CanaryflowError>;
}

/// In-memory checkpoint store.
///
/// Suitable for tests and single-process deployments; the chain layout
/// matches what a table keyed by (workflow_id, checkpoint_id) stores.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    chains: Mutex<HashMap<Uuid, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of checkpoints stored for a workflow.
    #[must_use]
    pub fn len(&self, workflow_id: Uuid) -> usize {
        self.chains
            .lock()
            .get(&workflow_id)
            .map_or(0, Vec::len)
    }

    /// Returns true if no checkpoints are stored for the workflow.
    #[must_use]
    pub fn is_empty(&self, workflow_id: Uuid) -> bool {
        self.len(workflow_id) == 0
    }

    /// Replaces a workflow's chain wholesale.
    ///
    /// Test helper for simulating recovery from a partial chain.
    pub fn seed_chain(&self, workflow_id: Uuid, chain: Vec<Checkpoint>) {
        self.chains.lock().insert(workflow_id, chain);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, checkpoint: Checkpoint) -> Result<(), CanaryflowError> {
        let mut chains = self.chains.lock();
        let chain = chains.entry(checkpoint.workflow_id).or_default();

        // Append-only: the new checkpoint must chain to the current tip.
        if let Some(tip) = chain.last() {
            if checkpoint.parent_id != Some(tip.checkpoint_id) {
                return Err(CanaryflowError::Persistence(format!(
                    "checkpoint parent {:?} does not match chain tip {}",
                    checkpoint.parent_id, tip.checkpoint_id
                )));
            }
        } else if checkpoint.parent_id.is_some() {
            return Err(CanaryflowError::Persistence(
                "first checkpoint must have no parent".to_string(),
            ));
        }

        chain.push(checkpoint);
        Ok(())
    }

    async fn latest(&self, workflow_id: Uuid) -> Result<Option<Checkpoint>, CanaryflowError> {
        Ok(self
            .chains
            .lock()
            .get(&workflow_id)
            .and_then(|chain| chain.last().cloned()))
    }

    async fn chain(&self, workflow_id: Uuid) -> Result<Vec<Checkpoint>, CanaryflowError> {
        self.chains
            .lock()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| NotFoundError::checkpoint(workflow_id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeSpec, OptimizationKind, TargetRef};
    use crate::rollout::RolloutPlan;

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new(
            TargetRef::new("web-01", "vm"),
            ChangeSpec::new("resize", OptimizationKind::Cost)
                .with_parameter("instance_type", serde_json::json!("m5.large")),
            RolloutPlan::default(),
        )
    }

    #[tokio::test]
    async fn test_append_and_latest() {
        let store = InMemoryCheckpointStore::new();
        let exec = execution();

        let first = Checkpoint::from_execution(&exec, None).unwrap();
        let first_id = first.checkpoint_id;
        store.append(first).await.unwrap();

        let second = Checkpoint::from_execution(&exec, Some(first_id)).unwrap();
        let second_id = second.checkpoint_id;
        store.append(second).await.unwrap();

        let latest = store.latest(exec.id).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second_id);
        assert_eq!(latest.parent_id, Some(first_id));
        assert_eq!(store.len(exec.id), 2);
    }

    #[tokio::test]
    async fn test_append_rejects_broken_chain() {
        let store = InMemoryCheckpointStore::new();
        let exec = execution();

        let first = Checkpoint::from_execution(&exec, None).unwrap();
        store.append(first).await.unwrap();

        // Parent points at a checkpoint that is not the tip.
        let orphan = Checkpoint::from_execution(&exec, Some(generate_uuid())).unwrap();
        let err = store.append(orphan).await.unwrap_err();
        assert!(matches!(err, CanaryflowError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_latest_on_unknown_workflow_is_none() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.latest(generate_uuid()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_through_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let mut exec = execution();
        exec.stage_index = 2;

        let cp = Checkpoint::from_execution(&exec, None).unwrap();
        store.append(cp).await.unwrap();

        let restored = store
            .latest(exec.id)
            .await
            .unwrap()
            .unwrap()
            .to_execution()
            .unwrap();
        assert_eq!(restored.stage_index, 2);
        assert_eq!(restored.id, exec.id);
    }
}
