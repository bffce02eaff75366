//! The workflow engine: drives one proposed change through analysis,
//! approval, graduated rollout, monitoring, and rollback.
//!
//! The engine is the only writer of workflow state. Every state
//! transition is committed by appending a checkpoint; a transition whose
//! checkpoint cannot be written does not happen, so the latest durable
//! checkpoint is always a safe resume point. `run` drives a workflow
//! until it reaches a terminal status or parks in `awaiting_approval`;
//! `approve`, `reject`, and `cancel` are the only external mutators.

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalPolicy};
use crate::baseline::{Baseline, BaselineStore, InMemoryBaselineStore, DEFAULT_MIN_SAMPLE_SIZE};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
use crate::core::{Artifact, ChangeSpec, ErrorDetail, TargetRef, WorkflowExecution, WorkflowStatus};
use crate::errors::{CanaryflowError, NotFoundError, ValidationError};
use crate::events::{EngineEvent, EventSink, NoOpEventSink};
use crate::health::{HealthConfig, HealthMonitor};
use crate::learning::{InMemoryLearningRecorder, LearningRecorder, OutcomeRecord};
use crate::ports::{ChangeApplier, MetricsCollector};
use crate::regression::{RegressionDetector, RegressionResult, RegressionThresholds};
use crate::rollback::RollbackManager;
use crate::rollout::{stage_step_name, RolloutPlan, StageAdvance, StageController};
use crate::utils::now_utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;


/// Bounded retry policy for checkpoint writes.
///
/// Only transient persistence failures are retried; once the budget is
/// exhausted the causing transition is aborted and the workflow stays in
/// its prior committed state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the computed delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with random jitter for the given attempt.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.max_delay_ms);
        let jitter = if capped > 1 {
            rand::thread_rng().gen_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Canary progression used when `start` is not given a plan.
    pub default_plan: RolloutPlan,
    /// Approval gating policy.
    pub approval_policy: ApprovalPolicy,
    /// Health monitoring configuration.
    pub health: HealthConfig,
    /// Regression severity thresholds.
    pub thresholds: RegressionThresholds,
    /// Retry policy for checkpoint writes.
    pub checkpoint_retry: RetryConfig,
    /// Minimum sample count for `establish_baseline`.
    pub min_baseline_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_plan: RolloutPlan::default(),
            approval_policy: ApprovalPolicy::default(),
            health: HealthConfig::default(),
            thresholds: RegressionThresholds::default(),
            checkpoint_retry: RetryConfig::default(),
            min_baseline_samples: DEFAULT_MIN_SAMPLE_SIZE,
        }
    }
}

/// Builder for [`WorkflowEngine`].
///
/// The applier and collector are required; stores, the learning
/// recorder, and the event sink default to in-memory/no-op
/// implementations.
pub struct WorkflowEngineBuilder {
    applier: Arc<dyn ChangeApplier>,
    collector: Arc<dyn MetricsCollector>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    baselines: Option<Arc<dyn BaselineStore>>,
    learning: Option<Arc<dyn LearningRecorder>>,
    sink: Option<Arc<dyn EventSink>>,
    config: EngineConfig,
}

impl WorkflowEngineBuilder {
    /// Sets the checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Sets the baseline store.
    #[must_use]
    pub fn with_baseline_store(mut self, store: Arc<dyn BaselineStore>) -> Self {
        self.baselines = Some(store);
        self
    }

    /// Sets the learning recorder.
    #[must_use]
    pub fn with_learning_recorder(mut self, recorder: Arc<dyn LearningRecorder>) -> Self {
        self.learning = Some(recorder);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the default rollout plan.
    #[must_use]
    pub fn with_default_plan(mut self, plan: RolloutPlan) -> Self {
        self.config.default_plan = plan;
        self
    }

    /// Sets the approval policy.
    #[must_use]
    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.config.approval_policy = policy;
        self
    }

    /// Sets the health monitoring configuration.
    #[must_use]
    pub fn with_health_config(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    /// Sets the regression thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: RegressionThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    /// Sets the checkpoint write retry policy.
    #[must_use]
    pub fn with_checkpoint_retry(mut self, retry: RetryConfig) -> Self {
        self.config.checkpoint_retry = retry;
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> WorkflowEngine {
        let detector = RegressionDetector::with_thresholds(self.config.thresholds);
        let monitor = HealthMonitor::new(
            self.collector.clone(),
            detector.clone(),
            self.config.health.clone(),
        );
        WorkflowEngine {
            inner: Arc::new(EngineInner {
                checkpoints: self
                    .checkpoints
                    .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
                baselines: self
                    .baselines
                    .unwrap_or_else(|| Arc::new(InMemoryBaselineStore::new())),
                learning: self
                    .learning
                    .unwrap_or_else(|| Arc::new(InMemoryLearningRecorder::new())),
                sink: self.sink.unwrap_or_else(|| Arc::new(NoOpEventSink)),
                gate: ApprovalGate::with_policy(self.config.approval_policy.clone()),
                detector,
                monitor,
                controller: StageController::new(self.applier.clone()),
                rollback: RollbackManager::new(self.applier.clone()),
                applier: self.applier,
                config: self.config,
                executions: DashMap::new(),
                tokens: DashMap::new(),
            }),
        }
    }
}

struct EngineInner {
    applier: Arc<dyn ChangeApplier>,
    checkpoints: Arc<dyn CheckpointStore>,
    baselines: Arc<dyn BaselineStore>,
    learning: Arc<dyn LearningRecorder>,
    sink: Arc<dyn EventSink>,
    gate: ApprovalGate,
    detector: RegressionDetector,
    monitor: HealthMonitor,
    controller: StageController,
    rollback: RollbackManager,
    config: EngineConfig,
    executions: DashMap<Uuid, Arc<AsyncMutex<WorkflowExecution>>>,
    tokens: DashMap<Uuid, Arc<CancellationToken>>,
}

/// Drives staged optimization workflows.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Starts building an engine over the given applier and collector.
    #[must_use]
    pub fn builder(
        applier: Arc<dyn ChangeApplier>,
        collector: Arc<dyn MetricsCollector>,
    ) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            applier,
            collector,
            checkpoints: None,
            baselines: None,
            learning: None,
            sink: None,
            config: EngineConfig::default(),
        }
    }

    /// Creates a workflow for a proposed change and commits its initial
    /// `pending` state. Does not run it.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty change, a not-found error
    /// when the target's configuration cannot be read, or a persistence
    /// error when the initial checkpoint cannot be written.
    pub async fn start(
        &self,
        target: TargetRef,
        change: ChangeSpec,
        plan: Option<RolloutPlan>,
    ) -> Result<Uuid, CanaryflowError> {
        if change.is_empty() {
            return Err(ValidationError::new("change has no parameters")
                .with_field("change")
                .into());
        }
        self.inner.applier.snapshot(&target).await?;

        let plan = plan.unwrap_or_else(|| self.inner.config.default_plan.clone());
        let execution = WorkflowExecution::new(target, change, plan);
        let id = execution.id;

        self.persist(&execution).await?;
        self.inner
            .executions
            .insert(id, Arc::new(AsyncMutex::new(execution)));
        self.inner.tokens.insert(id, CancellationToken::new());

        info!(workflow = %id, "workflow created");
        self.inner
            .sink
            .emit(EngineEvent::WorkflowCreated { workflow_id: id })
            .await;
        Ok(id)
    }

    /// Runs a workflow until it reaches a terminal status or parks in
    /// `awaiting_approval`, and returns its state.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown workflow or a persistence
    /// error if a transition's checkpoint cannot be committed; in the
    /// latter case the workflow stays at its last committed state.
    pub async fn run(&self, id: Uuid) -> Result<WorkflowExecution, CanaryflowError> {
        let entry = self.execution(id).await?;
        let token = self.token(id);
        let mut execution = entry.lock().await;
        self.drive(&mut execution, &token).await?;
        Ok(execution.clone())
    }

    /// Reloads a workflow from its latest checkpoint and continues it.
    ///
    /// The next action is derived from the committed status and step
    /// log, so a stage whose application was committed is never applied
    /// twice.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the workflow has no checkpoints.
    pub async fn resume(&self, id: Uuid) -> Result<WorkflowExecution, CanaryflowError> {
        if !self.inner.executions.contains_key(&id) {
            let checkpoint = self
                .inner
                .checkpoints
                .latest(id)
                .await?
                .ok_or_else(|| NotFoundError::checkpoint(id))?;
            let execution = checkpoint.to_execution()?;
            info!(workflow = %id, status = %execution.status, "resuming from checkpoint");
            self.inner
                .executions
                .insert(id, Arc::new(AsyncMutex::new(execution)));
        }
        self.run(id).await
    }

    /// Returns a workflow's current state.
    ///
    /// While a workflow is being actively driven this reads the latest
    /// committed checkpoint instead of blocking on the driver.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown workflow.
    pub async fn status(&self, id: Uuid) -> Result<WorkflowExecution, CanaryflowError> {
        if let Some(entry) = self.inner.executions.get(&id) {
            let entry = entry.clone();
            let snapshot = entry.try_lock().map(|execution| execution.clone());
            if let Ok(execution) = snapshot {
                return Ok(execution);
            }
        }
        let checkpoint = self
            .inner
            .checkpoints
            .latest(id)
            .await?
            .ok_or_else(|| NotFoundError::workflow(id))?;
        checkpoint.to_execution()
    }

    /// Requests cancellation of a workflow.
    ///
    /// A running workflow is interrupted at its next cancellation point
    /// (monitoring waits resolve promptly); a parked workflow is
    /// transitioned immediately.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown workflow.
    pub async fn cancel(&self, id: Uuid, reason: impl Into<String>) -> Result<(), CanaryflowError> {
        let entry = self.execution(id).await?;
        let reason = reason.into();
        let token = self.token(id);
        token.cancel(reason.clone());

        // A parked workflow has no driver to observe the token.
        if let Ok(mut execution) = entry.try_lock() {
            if !execution.status.is_terminal() {
                self.cancel_inflight(&mut execution, &token).await?;
            }
        }
        Ok(())
    }

    /// Approves a workflow parked in `awaiting_approval` and continues
    /// the rollout.
    ///
    /// # Errors
    ///
    /// Returns an invalid-transition error when the workflow is not
    /// awaiting approval, or an approval-timeout error when the approval
    /// window already expired (the workflow is then committed as
    /// `timeout`).
    pub async fn approve(&self, id: Uuid) -> Result<WorkflowExecution, CanaryflowError> {
        let entry = self.execution(id).await?;
        let token = self.token(id);
        let mut execution = entry.lock().await;

        if execution.status != WorkflowStatus::AwaitingApproval {
            return Err(CanaryflowError::InvalidTransition {
                workflow_id: id,
                message: format!("approve is only valid in awaiting_approval, not {}", execution.status),
            });
        }

        if let Some(deadline) = execution.approval_deadline {
            if now_utc() > deadline {
                self.expire_approval(&mut execution).await?;
                let elapsed = self
                    .inner
                    .gate
                    .policy()
                    .approval_timeout
                    .map_or(0.0, |t| t.as_secs_f64());
                return Err(CanaryflowError::ApprovalTimeout {
                    workflow_id: id,
                    timeout_seconds: elapsed,
                });
            }
        }

        execution.begin_step("approval", None);
        if let Some(step) = execution.last_step_mut() {
            step.complete(Some(serde_json::json!({ "decision": "approved" })));
        }
        self.commit(&mut execution, WorkflowStatus::RollingOut).await?;
        self.inner
            .sink
            .emit(EngineEvent::WorkflowApproved { workflow_id: id })
            .await;

        self.drive(&mut execution, &token).await?;
        Ok(execution.clone())
    }

    /// Rejects a workflow parked in `awaiting_approval`.
    ///
    /// # Errors
    ///
    /// Returns an invalid-transition error when the workflow is not
    /// awaiting approval.
    pub async fn reject(
        &self,
        id: Uuid,
        reason: impl Into<String>,
    ) -> Result<WorkflowExecution, CanaryflowError> {
        let entry = self.execution(id).await?;
        let mut execution = entry.lock().await;

        if execution.status != WorkflowStatus::AwaitingApproval {
            return Err(CanaryflowError::InvalidTransition {
                workflow_id: id,
                message: format!("reject is only valid in awaiting_approval, not {}", execution.status),
            });
        }

        let reason = reason.into();
        execution.begin_step("approval", None);
        if let Some(step) = execution.last_step_mut() {
            step.complete(Some(
                serde_json::json!({ "decision": "rejected", "reason": reason }),
            ));
        }
        execution.error = Some(ErrorDetail::new(format!("rejected by operator: {reason}")));
        self.commit(&mut execution, WorkflowStatus::Failed).await?;
        self.inner
            .sink
            .emit(EngineEvent::WorkflowRejected {
                workflow_id: id,
                reason,
            })
            .await;
        self.record_outcome(&execution).await;
        Ok(execution.clone())
    }

    /// Establishes a baseline for a target from raw metric samples,
    /// fingerprinted against the target's current configuration. A new
    /// baseline supersedes the target's previous active one.
    ///
    /// # Errors
    ///
    /// Returns an insufficient-data error when too few samples are
    /// given; nothing is stored in that case.
    pub async fn establish_baseline(
        &self,
        target: &TargetRef,
        samples: &[f64],
    ) -> Result<Baseline, CanaryflowError> {
        let snapshot = self.inner.applier.snapshot(target).await?;
        let baseline = Baseline::establish(
            target.to_string(),
            snapshot.fingerprint,
            samples,
            self.inner.config.min_baseline_samples,
        )?;
        self.inner.baselines.put(baseline.clone()).await?;
        info!(target = %target, baseline = %baseline.id, "baseline established");
        Ok(baseline)
    }

    /// Checks one observed value against a target's active baseline,
    /// recording an alert when a regression is detected.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the target has no active baseline.
    pub async fn check_regression(
        &self,
        target: &TargetRef,
        observed: f64,
    ) -> Result<RegressionResult, CanaryflowError> {
        let baseline = self
            .inner
            .baselines
            .active(&target.to_string())
            .await?
            .ok_or_else(|| NotFoundError::new("baseline", target.to_string()))?;

        let result = self.inner.detector.detect(&baseline, observed);
        if let Some(alert) = &result.alert {
            self.inner.baselines.record_alert(alert.clone()).await?;
            self.inner
                .sink
                .emit(EngineEvent::RegressionAlert {
                    alert: alert.clone(),
                })
                .await;
        }
        Ok(result)
    }

    // --- internals ---

    async fn execution(
        &self,
        id: Uuid,
    ) -> Result<Arc<AsyncMutex<WorkflowExecution>>, CanaryflowError> {
        if let Some(entry) = self.inner.executions.get(&id) {
            return Ok(entry.clone());
        }
        Err(NotFoundError::workflow(id).into())
    }

    fn token(&self, id: Uuid) -> Arc<CancellationToken> {
        self.inner
            .tokens
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Appends a checkpoint for the execution's current state, retrying
    /// transient failures within the configured budget.
    async fn persist(&self, execution: &WorkflowExecution) -> Result<(), CanaryflowError> {
        let parent = self
            .inner
            .checkpoints
            .latest(execution.id)
            .await?
            .map(|c| c.checkpoint_id);
        let retry = self.inner.config.checkpoint_retry;
        let mut attempt = 0u32;
        loop {
            let checkpoint = Checkpoint::from_execution(execution, parent)?;
            match self.inner.checkpoints.append(checkpoint).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay(attempt);
                    warn!(
                        workflow = %execution.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Commits a status transition: the in-memory state only moves once
    /// the checkpoint carrying the new state is durably appended.
    async fn commit(
        &self,
        execution: &mut WorkflowExecution,
        next: WorkflowStatus,
    ) -> Result<(), CanaryflowError> {
        let mut staged = execution.clone();
        staged.transition(next)?;
        self.persist(&staged).await?;
        debug!(workflow = %execution.id, from = %execution.status, to = %next, "transition committed");
        *execution = staged;
        Ok(())
    }

    async fn drive(
        &self,
        execution: &mut WorkflowExecution,
        token: &Arc<CancellationToken>,
    ) -> Result<(), CanaryflowError> {
        loop {
            if execution.status.is_terminal() {
                return Ok(());
            }
            if token.is_cancelled() {
                return self.cancel_inflight(execution, token).await;
            }

            match execution.status {
                WorkflowStatus::Pending => {
                    self.commit(execution, WorkflowStatus::Analyzing).await?;
                    self.inner
                        .sink
                        .emit(EngineEvent::WorkflowStarted {
                            workflow_id: execution.id,
                        })
                        .await;
                }

                WorkflowStatus::Analyzing => {
                    execution.begin_step("analyze", None);
                    match self.inner.applier.snapshot(&execution.target).await {
                        Ok(snapshot) => {
                            if let Some(step) = execution.last_step_mut() {
                                step.complete(Some(serde_json::json!({
                                    "config_fingerprint": snapshot.fingerprint,
                                })));
                            }
                            self.commit(execution, WorkflowStatus::Recommending).await?;
                        }
                        Err(err) => {
                            if let Some(step) = execution.last_step_mut() {
                                step.fail(err.to_string());
                            }
                            execution.error =
                                Some(ErrorDetail::new(format!("target analysis failed: {err}")));
                            return self.finish_failed(execution).await;
                        }
                    }
                }

                WorkflowStatus::Recommending => {
                    let bias = match self
                        .inner
                        .learning
                        .impact_bias(&execution.change.shape_key())
                        .await
                    {
                        Ok(bias) => bias,
                        Err(err) => {
                            warn!(workflow = %execution.id, error = %err, "impact bias lookup failed");
                            None
                        }
                    };
                    let decision = self.inner.gate.decide(&execution.change, bias);

                    execution.begin_step("recommend", Some(serde_json::json!({ "bias": bias })));
                    if let Some(step) = execution.last_step_mut() {
                        step.complete(serde_json::to_value(&decision).ok());
                    }

                    match decision {
                        ApprovalDecision::Approved { .. } => {
                            self.commit(execution, WorkflowStatus::RollingOut).await?;
                        }
                        ApprovalDecision::RequiresApproval { reason } => {
                            if let Some(timeout) = self.inner.gate.policy().approval_timeout {
                                execution.approval_deadline = chrono::Duration::from_std(timeout)
                                    .ok()
                                    .map(|d| now_utc() + d);
                            }
                            self.commit(execution, WorkflowStatus::AwaitingApproval)
                                .await?;
                            info!(workflow = %execution.id, %reason, "parked awaiting approval");
                            self.inner
                                .sink
                                .emit(EngineEvent::ApprovalRequired {
                                    workflow_id: execution.id,
                                    reason,
                                })
                                .await;
                            return Ok(());
                        }
                    }
                }

                WorkflowStatus::AwaitingApproval => {
                    if let Some(deadline) = execution.approval_deadline {
                        if now_utc() > deadline {
                            self.expire_approval(execution).await?;
                        }
                    }
                    // Still parked; approve/reject are the only ways out.
                    return Ok(());
                }

                WorkflowStatus::RollingOut => {
                    if self.inner.controller.stage_already_applied(execution) {
                        // Resume path: the apply was committed before the
                        // crash, so go straight back to monitoring.
                        self.commit(execution, WorkflowStatus::Monitoring).await?;
                        continue;
                    }
                    match self.inner.controller.apply_current(execution).await {
                        Ok(result) => {
                            self.inner
                                .sink
                                .emit(EngineEvent::StageApplied {
                                    workflow_id: execution.id,
                                    stage: execution.stage_index,
                                    percent: result.applied_percent,
                                })
                                .await;
                            self.commit(execution, WorkflowStatus::Monitoring).await?;
                        }
                        Err(err) => {
                            execution.error =
                                Some(ErrorDetail::new(format!("stage apply failed: {err}")));
                            self.inner
                                .sink
                                .emit(EngineEvent::StageFailed {
                                    workflow_id: execution.id,
                                    stage: execution.stage_index,
                                    reason: err.to_string(),
                                })
                                .await;
                            self.commit(execution, WorkflowStatus::RollingBack).await?;
                        }
                    }
                }

                WorkflowStatus::Monitoring => {
                    self.monitor_stage(execution, token).await?;
                    if execution.status.is_terminal()
                        || execution.status == WorkflowStatus::AwaitingApproval
                    {
                        return Ok(());
                    }
                }

                WorkflowStatus::RollingBack => {
                    return self.finish_rollback(execution).await;
                }

                // Terminal statuses are handled at the top of the loop.
                WorkflowStatus::Succeeded
                | WorkflowStatus::RolledBack
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Timeout => return Ok(()),
            }
        }
    }

    /// Runs the current stage's monitoring window and folds the verdict
    /// into the progression.
    async fn monitor_stage(
        &self,
        execution: &mut WorkflowExecution,
        token: &Arc<CancellationToken>,
    ) -> Result<(), CanaryflowError> {
        let stage = execution
            .plan
            .stage(execution.stage_index)
            .copied()
            .ok_or_else(|| CanaryflowError::InvalidTransition {
                workflow_id: execution.id,
                message: format!("no rollout stage at index {}", execution.stage_index),
            })?;

        let baseline = match self
            .inner
            .baselines
            .active(&execution.target.to_string())
            .await
        {
            Ok(baseline) => baseline,
            Err(err) => {
                warn!(
                    workflow = %execution.id,
                    error = %err,
                    "baseline lookup failed, monitoring against healthy floor"
                );
                None
            }
        };

        let verdict = self
            .inner
            .monitor
            .observe(
                &execution.target,
                baseline.as_ref(),
                stage.monitor_window(),
                token,
            )
            .await;

        for alert in &verdict.alerts {
            if let Err(err) = self.inner.baselines.record_alert(alert.clone()).await {
                warn!(workflow = %execution.id, error = %err, "failed to record regression alert");
            }
            self.inner.sink.try_emit(EngineEvent::RegressionAlert {
                alert: alert.clone(),
            });
        }

        if verdict.cancelled || token.is_cancelled() {
            return self.cancel_inflight(execution, token).await;
        }

        let step_name = stage_step_name("monitor", execution.stage_index, stage.percent);
        execution.begin_step(
            step_name,
            Some(serde_json::json!({ "window_secs": stage.monitor_secs })),
        );
        let summary = serde_json::json!({
            "score": verdict.score,
            "samples": verdict.samples,
            "passed": verdict.passed,
        });
        if let Some(step) = execution.last_step_mut() {
            if verdict.passed {
                step.complete(Some(summary));
            } else {
                step.fail(
                    verdict
                        .failure_summary()
                        .unwrap_or_else(|| "health verification failed".to_string()),
                );
            }
        }

        match self.inner.controller.record_verdict(execution, &verdict) {
            StageAdvance::Continue { next_index } => {
                self.inner
                    .sink
                    .emit(EngineEvent::StagePassed {
                        workflow_id: execution.id,
                        next_stage: next_index,
                        score: verdict.score,
                    })
                    .await;
                self.commit(execution, WorkflowStatus::RollingOut).await?;
            }
            StageAdvance::Done => {
                execution.record_artifact(Artifact::new(
                    "health-report",
                    "health",
                    serde_json::json!({
                        "final_score": verdict.score,
                        "samples": verdict.samples,
                        "stages": execution.plan.len(),
                    }),
                ));
                execution.output = Some(serde_json::json!({
                    "applied_percent": 100,
                    "final_score": verdict.score,
                }));
                self.commit(execution, WorkflowStatus::Succeeded).await?;
                info!(workflow = %execution.id, "workflow succeeded");
                self.inner
                    .sink
                    .emit(EngineEvent::WorkflowSucceeded {
                        workflow_id: execution.id,
                    })
                    .await;
                self.record_outcome(execution).await;
            }
            StageAdvance::Abort { reason } => {
                execution.error = Some(ErrorDetail::new(reason.clone()));
                self.inner
                    .sink
                    .emit(EngineEvent::StageFailed {
                        workflow_id: execution.id,
                        stage: execution.stage_index,
                        reason,
                    })
                    .await;
                self.commit(execution, WorkflowStatus::RollingBack).await?;
            }
        }
        Ok(())
    }

    /// Completes a `rolling_back` workflow: reverts the target and
    /// commits `rolled_back`, or `failed` when the revert itself fails.
    async fn finish_rollback(
        &self,
        execution: &mut WorkflowExecution,
    ) -> Result<(), CanaryflowError> {
        let reason = execution
            .error
            .as_ref()
            .map_or_else(|| "rollout aborted".to_string(), |e| e.message.clone());

        match self.inner.rollback.rollback(execution, reason.as_str()).await {
            Ok(result) => {
                execution.output = Some(serde_json::json!({
                    "reverted": result.reverted,
                    "restored_fingerprint": result.restored_fingerprint,
                }));
                self.commit(execution, WorkflowStatus::RolledBack).await?;
                self.inner
                    .sink
                    .emit(EngineEvent::WorkflowRolledBack {
                        workflow_id: execution.id,
                        reason,
                    })
                    .await;
                self.record_outcome(execution).await;
                Ok(())
            }
            Err(err) => {
                execution.error = Some(
                    ErrorDetail::new(format!("{reason}; rollback failed: {err}"))
                        .rollback_failed(),
                );
                self.finish_failed(execution).await
            }
        }
    }

    /// Cancels a non-terminal workflow, reverting any applied change
    /// first so the target is not left partially changed.
    async fn cancel_inflight(
        &self,
        execution: &mut WorkflowExecution,
        token: &Arc<CancellationToken>,
    ) -> Result<(), CanaryflowError> {
        let reason = token
            .reason()
            .unwrap_or_else(|| "cancelled".to_string());

        if execution.pre_change_snapshot.is_some() {
            match self.inner.rollback.rollback(execution, reason.as_str()).await {
                Ok(result) => {
                    execution.output = Some(serde_json::json!({
                        "reverted": result.reverted,
                        "restored_fingerprint": result.restored_fingerprint,
                    }));
                }
                Err(err) => {
                    execution.error = Some(
                        ErrorDetail::new(format!("cancelled, but rollback failed: {err}"))
                            .rollback_failed(),
                    );
                }
            }
        }

        self.commit(execution, WorkflowStatus::Cancelled).await?;
        info!(workflow = %execution.id, %reason, "workflow cancelled");
        self.inner
            .sink
            .emit(EngineEvent::WorkflowCancelled {
                workflow_id: execution.id,
                reason,
            })
            .await;
        self.record_outcome(execution).await;
        Ok(())
    }

    async fn expire_approval(
        &self,
        execution: &mut WorkflowExecution,
    ) -> Result<(), CanaryflowError> {
        execution.error = Some(ErrorDetail::new("approval window expired"));
        self.commit(execution, WorkflowStatus::Timeout).await?;
        warn!(workflow = %execution.id, "approval window expired");
        self.inner
            .sink
            .emit(EngineEvent::WorkflowTimeout {
                workflow_id: execution.id,
            })
            .await;
        self.record_outcome(execution).await;
        Ok(())
    }

    async fn finish_failed(
        &self,
        execution: &mut WorkflowExecution,
    ) -> Result<(), CanaryflowError> {
        self.commit(execution, WorkflowStatus::Failed).await?;
        self.inner
            .sink
            .emit(EngineEvent::WorkflowFailed {
                workflow_id: execution.id,
                reason: execution.error.as_ref().map(|e| e.message.clone()),
            })
            .await;
        self.record_outcome(execution).await;
        Ok(())
    }

    /// Feeds a terminal outcome to the learning recorder. Recorder
    /// failures never change the workflow's status.
    async fn record_outcome(&self, execution: &WorkflowExecution) {
        let record = OutcomeRecord::from_execution(execution);
        if let Err(err) = self.inner.learning.record(record).await {
            warn!(workflow = %execution.id, error = %err, "failed to record workflow outcome");
        }
    }
}
