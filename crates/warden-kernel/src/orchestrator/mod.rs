//! Multi-step plan execution.
//!
//! Every step is re-scored and re-authorized through the gateway right
//! before dispatch, against a fresh [`EvaluationContext`] snapshot. Stop
//! conditions:
//!
//! - **Loop prevention**: a step whose signature was already dispatched more
//!   than `repeat_bound` times aborts the rest of the plan.
//! - **Risk budget**: cumulative dispatched risk may not exceed `risk_budget`.
//! - **Failures**: `max_consecutive_failures` in a row, or any failure under
//!   `FailurePolicy::Abort`.
//! - **Confirmation**: a CRITICAL step, or one above the approved ceiling,
//!   suspends the plan until [`Orchestrator::resume`].
//!
//! A failed step poisons its dependents, which are reported as skipped.
//! Nothing is rolled back automatically.

use crate::aggregate::{WorkflowRiskAggregator, WorkflowRiskAssessment};
use crate::audit::ExecutionRecord;
use crate::config::{FailurePolicy, RepeatMatching};
use crate::context::EvaluationContext;
use crate::error::{AuditError, GovernanceError, ValidationError};
use crate::gateway::{
    ApprovedCommand, ConfirmationToken, Decision, EvaluateOptions, ExecutionGateway, GatewayDecision,
    GatewayMode, Resolution,
};
use crate::risk::RiskAssessment;
use crate::types::{CommandId, PermissionMode, RecordId, RiskLevel};
use crate::workflow::{CommandTemplate, StepId, Workflow, WorkflowId, WorkflowStep};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Up-front approval for a whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanApproval {
    #[default]
    None,
    /// Steps up to `ceiling` (never CRITICAL) run without asking again
    Approved { ceiling: RiskLevel },
}

impl PlanApproval {
    /// Approval matching an aggregate assessment.
    pub fn for_assessment(assessment: &WorkflowRiskAssessment) -> Self {
        PlanApproval::Approved {
            ceiling: assessment.level,
        }
    }

    pub fn ceiling(self) -> Option<RiskLevel> {
        match self {
            PlanApproval::None => None,
            PlanApproval::Approved { ceiling } => Some(ceiling),
        }
    }
}

/// Cooperative cancellation, checked between steps. An in-flight dispatch
/// always finishes and is recorded.
#[derive(Debug, Clone, Default)]
pub struct PlanCancellation(Arc<AtomicBool>);

impl PlanCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    DependencyFailed { dependency: StepId },
    PlanAborted,
    AwaitingConfirmation,
    AwaitingPlanApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed { reason: String },
    Rejected { reason: String },
    AwaitingConfirmation {
        token: ConfirmationToken,
        level: RiskLevel,
        ceiling: RiskLevel,
    },
    Cyclic { signature: String },
    BudgetExceeded { score: f64, remaining: f64 },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: StepId,
    pub order: usize,
    pub intent: String,
    pub status: StepStatus,
    pub risk: Option<RiskLevel>,
    pub score: Option<f64>,
    pub command_id: Option<CommandId>,
    pub record_id: Option<RecordId>,
}

impl StepOutcome {
    fn new(step: &WorkflowStep, status: StepStatus) -> Self {
        Self {
            step: step.id.clone(),
            order: step.order,
            intent: step.template.intent.clone(),
            status,
            risk: None,
            score: None,
            command_id: None,
            record_id: None,
        }
    }

    fn assessed(mut self, assessment: &RiskAssessment) -> Self {
        self.risk = Some(assessment.level);
        self.score = Some(assessment.score);
        self
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, StepStatus::Skipped { .. })
    }

    /// The governance error this outcome represents, if any.
    pub fn error(&self) -> Option<GovernanceError> {
        match &self.status {
            StepStatus::Completed | StepStatus::BudgetExceeded { .. } => None,
            StepStatus::Failed { reason } => Some(GovernanceError::ExecutionFailed {
                command_id: self.command_id.unwrap_or_default(),
                reason: reason.clone(),
            }),
            StepStatus::Rejected { reason } => Some(GovernanceError::PolicyDenied {
                intent: self.intent.clone(),
                reason: reason.clone(),
            }),
            StepStatus::AwaitingConfirmation { token, level, ceiling } => Some(GovernanceError::RiskBlocked {
                level: *level,
                ceiling: *ceiling,
                token: Some(*token),
            }),
            StepStatus::Cyclic { signature } => Some(GovernanceError::CyclicPlan {
                step: self.step.to_string(),
                signature: signature.clone(),
            }),
            StepStatus::Skipped {
                reason: SkipReason::DependencyFailed { dependency },
            } => Some(GovernanceError::DependencyFailed {
                step: self.step.to_string(),
                dependency: dependency.to_string(),
            }),
            StepStatus::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    Cyclic { step: StepId, signature: String },
    RiskBudgetExhausted { step: StepId },
    ConsecutiveFailures { count: u32 },
    StepFailed { step: StepId },
    ConfirmationDenied { step: StepId },
    /// The step's state capture or audit record failed; nothing after it ran
    Irrecoverable { step: StepId, error: AuditError },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanStatus {
    Completed,
    PartiallyFailed,
    Aborted { reason: AbortReason },
    BlockedOnConfirmation,
}

/// Complete account of one run: exactly one outcome per step.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub workflow_id: WorkflowId,
    pub status: PlanStatus,
    pub outcomes: Vec<StepOutcome>,
    pub records: Vec<ExecutionRecord>,
    pub cumulative_risk: f64,
    pub steps_dispatched: u64,
    pub aggregate: WorkflowRiskAssessment,
    #[serde(skip)]
    pub suspended: Option<SuspendedPlan>,
}

impl PlanReport {
    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step.as_str() == step)
    }

    pub fn completed_steps(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == StepStatus::Completed)
            .count()
    }

    pub fn is_blocked(&self) -> bool {
        self.status == PlanStatus::BlockedOnConfirmation
    }

    /// Error for a plan stopped by a cycle, an audit failure or a
    /// cancellation.
    pub fn abort_error(&self) -> Option<GovernanceError> {
        match &self.status {
            PlanStatus::Aborted {
                reason: AbortReason::Irrecoverable { error, .. },
            } => Some(GovernanceError::Irrecoverable(error.clone())),
            PlanStatus::Aborted {
                reason: AbortReason::Cyclic { step, signature },
            } => Some(GovernanceError::CyclicPlan {
                step: step.to_string(),
                signature: signature.clone(),
            }),
            PlanStatus::Aborted {
                reason: AbortReason::Cancelled,
            } => Some(GovernanceError::Cancelled),
            _ => None,
        }
    }
}

/// A plan halted on a step confirmation. Hand it back to
/// [`Orchestrator::resume`] or [`Orchestrator::cancel_suspended`].
#[derive(Debug, Clone)]
pub struct SuspendedPlan {
    state: PlanExecutionState,
    token: ConfirmationToken,
    index: usize,
}

impl SuspendedPlan {
    pub fn token(&self) -> ConfirmationToken {
        self.token
    }

    pub fn blocked_step(&self) -> &StepId {
        &self.state.workflow.steps()[self.index].id
    }

    pub fn state(&self) -> &PlanExecutionState {
        &self.state
    }
}

/// In-flight bookkeeping for one plan run. Never persisted.
#[derive(Debug, Clone)]
pub struct PlanExecutionState {
    workflow: Workflow,
    approval: PlanApproval,
    aggregate: WorkflowRiskAssessment,
    cursor: usize,
    /// Dispatched signatures with their counts
    signatures: BTreeMap<String, u32>,
    cumulative_risk: f64,
    step_counter: u64,
    consecutive_failures: u32,
    succeeded: BTreeSet<StepId>,
    outcomes: Vec<Option<StepOutcome>>,
    records: Vec<ExecutionRecord>,
}

impl PlanExecutionState {
    fn new(workflow: Workflow, approval: PlanApproval, aggregate: WorkflowRiskAssessment) -> Self {
        let outcomes = vec![None; workflow.len()];
        Self {
            workflow,
            approval,
            aggregate,
            cursor: 0,
            signatures: BTreeMap::new(),
            cumulative_risk: 0.0,
            step_counter: 0,
            consecutive_failures: 0,
            succeeded: BTreeSet::new(),
            outcomes,
            records: Vec::new(),
        }
    }

    pub fn remaining(&self) -> &[WorkflowStep] {
        &self.workflow.steps()[self.cursor.min(self.workflow.len())..]
    }

    pub fn cumulative_risk(&self) -> f64 {
        self.cumulative_risk
    }

    pub fn step_counter(&self) -> u64 {
        self.step_counter
    }

    fn signature(template: &CommandTemplate, matching: RepeatMatching) -> String {
        match matching {
            RepeatMatching::Exact => template.signature(),
            RepeatMatching::IntentOnly => template.intent.clone(),
        }
    }

    fn failed_dependency(&self, step: &WorkflowStep) -> Option<StepId> {
        step.depends_on
            .iter()
            .find(|dep| !self.succeeded.contains(*dep))
            .cloned()
    }

    fn set(&mut self, index: usize, outcome: StepOutcome) {
        self.outcomes[index] = Some(outcome);
    }

    /// Counts a failed step; returns why the plan must stop, if it must.
    fn register_failure(&mut self, step: &StepId, ctx: &EvaluationContext) -> Option<AbortReason> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= ctx.config.max_consecutive_failures {
            Some(AbortReason::ConsecutiveFailures {
                count: self.consecutive_failures,
            })
        } else if ctx.config.failure_policy == FailurePolicy::Abort {
            Some(AbortReason::StepFailed { step: step.clone() })
        } else {
            None
        }
    }

    fn report(&self, status: PlanStatus, unfilled: &SkipReason) -> PlanReport {
        let outcomes = self
            .outcomes
            .iter()
            .zip(self.workflow.steps())
            .map(|(outcome, step)| {
                outcome.clone().unwrap_or_else(|| {
                    StepOutcome::new(
                        step,
                        StepStatus::Skipped {
                            reason: unfilled.clone(),
                        },
                    )
                })
            })
            .collect();
        PlanReport {
            workflow_id: self.workflow.id(),
            status,
            outcomes,
            records: self.records.clone(),
            cumulative_risk: self.cumulative_risk,
            steps_dispatched: self.step_counter,
            aggregate: self.aggregate.clone(),
            suspended: None,
        }
    }

    fn abort(self, reason: AbortReason) -> PlanReport {
        tracing::warn!(workflow = %self.workflow.id(), reason = ?reason, "plan aborted");
        self.report(PlanStatus::Aborted { reason }, &SkipReason::PlanAborted)
    }

    fn suspend(self, token: ConfirmationToken, index: usize) -> PlanReport {
        let mut report = self.report(PlanStatus::BlockedOnConfirmation, &SkipReason::AwaitingConfirmation);
        report.suspended = Some(SuspendedPlan {
            state: self,
            token,
            index,
        });
        report
    }

    fn finish(self) -> PlanReport {
        let clean = self
            .outcomes
            .iter()
            .flatten()
            .all(|o| o.status == StepStatus::Completed);
        let status = if clean {
            PlanStatus::Completed
        } else {
            PlanStatus::PartiallyFailed
        };
        tracing::info!(workflow = %self.workflow.id(), status = ?status, dispatched = self.step_counter, "plan finished");
        self.report(status, &SkipReason::PlanAborted)
    }
}

/// Expands a free-form goal into ordered command templates.
#[async_trait::async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str) -> Result<Vec<CommandTemplate>, GovernanceError>;
}

/// Highest level that runs without confirmation under a mode.
fn auto_ceiling(mode: PermissionMode) -> RiskLevel {
    match mode {
        PermissionMode::Strict => RiskLevel::Low,
        PermissionMode::Moderate => RiskLevel::Medium,
        PermissionMode::Relaxed => RiskLevel::High,
    }
}

enum StepFlow {
    Next,
    Stop(PlanReport),
}

pub struct Orchestrator {
    gateway: Arc<ExecutionGateway>,
    aggregator: WorkflowRiskAggregator,
}

impl Orchestrator {
    pub fn new(gateway: Arc<ExecutionGateway>) -> Self {
        Self {
            gateway,
            aggregator: WorkflowRiskAggregator::new(),
        }
    }

    pub fn gateway(&self) -> &Arc<ExecutionGateway> {
        &self.gateway
    }

    /// Plan-level risk against the current context.
    pub fn assess(&self, workflow: &Workflow) -> WorkflowRiskAssessment {
        self.aggregator.aggregate(workflow, &self.gateway.state().snapshot())
    }

    pub async fn run(
        &self,
        workflow: &Workflow,
        approval: PlanApproval,
        cancel: &PlanCancellation,
    ) -> Result<PlanReport, GovernanceError> {
        let ctx = self.gateway.state().snapshot();
        let limit = ctx.config.max_plan_steps;
        if workflow.len() > limit {
            return Err(ValidationError::PlanTooLong {
                steps: workflow.len(),
                limit,
            }
            .into());
        }

        let aggregate = self.aggregator.aggregate(workflow, &ctx);
        tracing::info!(
            workflow = %workflow.id(),
            steps = workflow.len(),
            risk = ?aggregate.level,
            score = aggregate.score,
            "starting plan"
        );
        let state = PlanExecutionState::new(workflow.clone(), approval, aggregate);
        if state.aggregate.requires_confirmation && approval.ceiling().is_none() {
            tracing::info!(workflow = %workflow.id(), "plan needs up-front approval");
            return Ok(state.report(PlanStatus::BlockedOnConfirmation, &SkipReason::AwaitingPlanApproval));
        }
        self.drive(state, cancel).await
    }

    /// Expand a goal with `planner` and run it as a sequential plan.
    pub async fn run_goal(
        &self,
        goal: &str,
        planner: &dyn Planner,
        approval: PlanApproval,
        cancel: &PlanCancellation,
    ) -> Result<PlanReport, GovernanceError> {
        let templates = planner.plan(goal).await?;
        let workflow = Workflow::sequential(goal, templates)?;
        self.run(&workflow, approval, cancel).await
    }

    /// Continue a suspended plan with the decision for its blocked step.
    /// A denial or an expired confirmation aborts the remainder.
    pub async fn resume(
        &self,
        suspended: SuspendedPlan,
        decision: Decision,
        cancel: &PlanCancellation,
    ) -> Result<PlanReport, GovernanceError> {
        let SuspendedPlan {
            mut state,
            token,
            index,
        } = suspended;
        if cancel.is_cancelled() {
            return self.cancel_suspended(SuspendedPlan { state, token, index });
        }
        let step = state.workflow.steps()[index].clone();
        match self.gateway.resolve(token, decision) {
            Ok(Resolution::Approved(approved)) => {
                let ctx = self.gateway.state().snapshot();
                if let StepFlow::Stop(report) = self.dispatch_step(&mut state, index, approved, &ctx).await? {
                    return Ok(report);
                }
                state.cursor = index + 1;
                self.drive(state, cancel).await
            }
            Ok(Resolution::Rejected(_)) | Err(GovernanceError::ConfirmationExpired(_)) => {
                let reason = match decision {
                    Decision::Deny => "confirmation denied",
                    Decision::Approve => "confirmation expired",
                };
                state.set(
                    index,
                    StepOutcome::new(&step, StepStatus::Rejected { reason: reason.into() }),
                );
                Ok(state.abort(AbortReason::ConfirmationDenied { step: step.id }))
            }
            Err(e) => Err(e),
        }
    }

    /// Withdraw the pending confirmation and abort the plan.
    pub fn cancel_suspended(&self, suspended: SuspendedPlan) -> Result<PlanReport, GovernanceError> {
        let SuspendedPlan {
            mut state,
            token,
            index,
        } = suspended;
        match self.gateway.cancel(token) {
            Ok(_) | Err(GovernanceError::UnknownConfirmation(_)) => {}
            Err(e) => return Err(e),
        }
        let step = state.workflow.steps()[index].clone();
        state.set(
            index,
            StepOutcome::new(&step, StepStatus::Rejected { reason: "cancelled".into() }),
        );
        Ok(state.abort(AbortReason::Cancelled))
    }

    async fn drive(
        &self,
        mut state: PlanExecutionState,
        cancel: &PlanCancellation,
    ) -> Result<PlanReport, GovernanceError> {
        while state.cursor < state.workflow.len() {
            if cancel.is_cancelled() {
                return Ok(state.abort(AbortReason::Cancelled));
            }
            let index = state.cursor;
            let step = state.workflow.steps()[index].clone();

            if let Some(dependency) = state.failed_dependency(&step) {
                tracing::info!(step = %step.id, %dependency, "skipping step after failed dependency");
                state.set(
                    index,
                    StepOutcome::new(
                        &step,
                        StepStatus::Skipped {
                            reason: SkipReason::DependencyFailed { dependency },
                        },
                    ),
                );
                state.cursor += 1;
                continue;
            }

            let ctx = self.gateway.state().snapshot();
            let signature = PlanExecutionState::signature(&step.template, ctx.config.loop_detection.matching);
            let seen = state.signatures.get(&signature).copied().unwrap_or(0);
            if seen > ctx.config.loop_detection.repeat_bound {
                state.set(
                    index,
                    StepOutcome::new(
                        &step,
                        StepStatus::Cyclic {
                            signature: signature.clone(),
                        },
                    ),
                );
                return Ok(state.abort(AbortReason::Cyclic {
                    step: step.id,
                    signature,
                }));
            }

            let command = step
                .template
                .instantiate()
                .with_raw_input(format!("{} step {}: {}", state.workflow.name(), step.id, step.description));
            let options = EvaluateOptions {
                mode: GatewayMode::Execute,
                modifiers: Vec::new(),
                approved_ceiling: state.approval.ceiling(),
            };

            match self.gateway.evaluate_with(command, &ctx, &options) {
                Ok(GatewayDecision::Approved(approved)) => {
                    if let StepFlow::Stop(report) = self.dispatch_step(&mut state, index, approved, &ctx).await? {
                        return Ok(report);
                    }
                }
                Ok(GatewayDecision::AwaitingConfirmation(request)) => {
                    let level = request.preview.assessment.level;
                    let ceiling = state
                        .approval
                        .ceiling()
                        .unwrap_or_else(|| auto_ceiling(ctx.permission_mode));
                    tracing::warn!(step = %step.id, risk = ?level, ceiling = ?ceiling, token = %request.token, "plan halted for confirmation");
                    state.set(
                        index,
                        StepOutcome::new(
                            &step,
                            StepStatus::AwaitingConfirmation {
                                token: request.token,
                                level,
                                ceiling,
                            },
                        )
                        .assessed(&request.preview.assessment),
                    );
                    return Ok(state.suspend(request.token, index));
                }
                Ok(GatewayDecision::Previewed(_)) => {
                    return Err(ValidationError::Malformed(format!(
                        "step '{}' was previewed instead of dispatched",
                        step.id
                    ))
                    .into());
                }
                Err(GovernanceError::PolicyDenied { reason, .. }) => {
                    state.set(index, StepOutcome::new(&step, StepStatus::Rejected { reason }));
                    if let Some(reason) = state.register_failure(&step.id, &ctx) {
                        return Ok(state.abort(reason));
                    }
                }
                Err(GovernanceError::Validation(e)) => {
                    state.set(
                        index,
                        StepOutcome::new(&step, StepStatus::Rejected { reason: e.to_string() }),
                    );
                    if let Some(reason) = state.register_failure(&step.id, &ctx) {
                        return Ok(state.abort(reason));
                    }
                }
                Err(e) => return Err(e),
            }
            state.cursor += 1;
        }
        Ok(state.finish())
    }

    async fn dispatch_step(
        &self,
        state: &mut PlanExecutionState,
        index: usize,
        approved: ApprovedCommand,
        ctx: &EvaluationContext,
    ) -> Result<StepFlow, GovernanceError> {
        let step = state.workflow.steps()[index].clone();
        let assessment = approved.assessment().clone();

        let budget = ctx.config.risk_budget;
        if state.cumulative_risk + assessment.score > budget {
            state.set(
                index,
                StepOutcome::new(
                    &step,
                    StepStatus::BudgetExceeded {
                        score: assessment.score,
                        remaining: budget - state.cumulative_risk,
                    },
                )
                .assessed(&assessment),
            );
            let reason = AbortReason::RiskBudgetExhausted { step: step.id };
            return Ok(StepFlow::Stop(state.clone().abort(reason)));
        }

        let signature = PlanExecutionState::signature(&step.template, ctx.config.loop_detection.matching);
        *state.signatures.entry(signature).or_insert(0) += 1;
        state.step_counter += 1;
        state.cumulative_risk += assessment.score;

        let dispatched = match self.gateway.dispatch(approved).await {
            Ok(dispatched) => dispatched,
            Err(GovernanceError::Irrecoverable(error)) => {
                tracing::error!(step = %step.id, %error, "audit failure; aborting plan");
                state.set(
                    index,
                    StepOutcome::new(
                        &step,
                        StepStatus::Failed {
                            reason: error.to_string(),
                        },
                    )
                    .assessed(&assessment),
                );
                let reason = AbortReason::Irrecoverable { step: step.id, error };
                return Ok(StepFlow::Stop(state.clone().abort(reason)));
            }
            Err(e) => return Err(e),
        };
        let mut outcome = if dispatched.succeeded() {
            StepOutcome::new(&step, StepStatus::Completed)
        } else {
            StepOutcome::new(
                &step,
                StepStatus::Failed {
                    reason: dispatched.record.error.clone().unwrap_or_default(),
                },
            )
        }
        .assessed(&assessment);
        outcome.command_id = Some(dispatched.command.id);
        outcome.record_id = Some(dispatched.record.record_id);
        state.set(index, outcome);
        state.records.push(dispatched.record.clone());

        if dispatched.succeeded() {
            state.succeeded.insert(step.id);
            state.consecutive_failures = 0;
            return Ok(StepFlow::Next);
        }
        tracing::warn!(step = %step.id, "step failed");
        match state.register_failure(&step.id, ctx) {
            Some(reason) => Ok(StepFlow::Stop(state.clone().abort(reason))),
            None => Ok(StepFlow::Next),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}
