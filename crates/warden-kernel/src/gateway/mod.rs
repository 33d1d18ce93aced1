//! Execution gateway.
//!
//! Drives one command through
//! `Created → RiskScored → PolicyChecked → {AutoApproved | AwaitingConfirmation}
//! → {Approved | Rejected} → Dispatched → {Completed | Failed}`.
//!
//! Confirmation is two-phase: [`ExecutionGateway::evaluate`] parks the
//! command under a [`ConfirmationToken`] and returns; only an explicit
//! [`ExecutionGateway::resolve`] or [`ExecutionGateway::cancel`] moves it on.
//! Silence never approves. Dry-run runs the same pipeline and ends in
//! `Previewed`.
//!
//! Only an [`ApprovedCommand`] can be dispatched, and only the gateway can
//! create one.

use crate::audit::{ExecutionLogger, ExecutionRecord, StateSnapshot};
use crate::config::{ConfirmationTimeout, GovernanceConfig};
use crate::context::{EvaluationContext, GovernanceState};
use crate::error::{GovernanceError, ValidationError};
use crate::executor::{ActionExecutor, ActionOutcome, ActionRequest};
use crate::policy::{CapabilityRegistry, PolicyDecision};
use crate::risk::{RiskAssessment, RiskFactor, RiskScorer};
use crate::state_machine::{GatewayState, StateTrace};
use crate::types::{Command, CommandStatus, RiskLevel};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Handle for a command parked in `AwaitingConfirmation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfirmationToken(pub Uuid);

impl ConfirmationToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConfirmationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    #[default]
    Execute,
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

/// How an approved command got its approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Approval {
    Automatic,
    Confirmed,
    /// Covered by an up-front plan approval
    PlanCeiling { ceiling: RiskLevel },
}

#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
    pub mode: GatewayMode,
    /// Extra factors multiplied into the score
    pub modifiers: Vec<RiskFactor>,
    /// Steps at or below this level (never CRITICAL) skip per-step confirmation
    pub approved_ceiling: Option<RiskLevel>,
}

impl EvaluateOptions {
    pub fn new(mode: GatewayMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// A confirmation swept by [`ExecutionGateway::reject_expired`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiredConfirmation {
    pub token: ConfirmationToken,
    pub command: Command,
    pub trace: StateTrace,
}

/// What would happen, at what risk, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub command: Command,
    pub assessment: RiskAssessment,
    pub capability: String,
    pub requires_confirmation: bool,
    pub summary: String,
    pub trace: StateTrace,
}

impl Preview {
    fn new(
        command: Command,
        assessment: RiskAssessment,
        capability: String,
        requires_confirmation: bool,
        trace: StateTrace,
    ) -> Self {
        let params = serde_json::to_string(&command.entities).unwrap_or_default();
        let gate = if requires_confirmation {
            "confirmation required"
        } else {
            "no confirmation needed"
        };
        let summary = format!(
            "would run {} {} under capability '{}': {}; {}",
            command.intent,
            params,
            capability,
            assessment.explain(),
            gate
        );
        Self {
            command,
            assessment,
            capability,
            requires_confirmation,
            summary,
            trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub token: ConfirmationToken,
    pub preview: Preview,
    pub requested_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A command that cleared the gateway and may be dispatched.
#[derive(Debug, Clone)]
pub struct ApprovedCommand {
    command: Command,
    assessment: RiskAssessment,
    capability: String,
    approval: Approval,
    trace: StateTrace,
    config: Arc<GovernanceConfig>,
}

impl ApprovedCommand {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn assessment(&self) -> &RiskAssessment {
        &self.assessment
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn approval(&self) -> Approval {
        self.approval
    }

    pub fn trace(&self) -> &StateTrace {
        &self.trace
    }
}

#[derive(Debug, Clone)]
pub enum GatewayDecision {
    Approved(ApprovedCommand),
    AwaitingConfirmation(ConfirmationRequest),
    Previewed(Preview),
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Approved(ApprovedCommand),
    Rejected(Command),
}

/// Result of a dispatch. A failed step is still a successful dispatch: it
/// has a record.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub command: Command,
    pub record: ExecutionRecord,
    pub trace: StateTrace,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.success
    }

    pub fn into_result(self) -> Result<Option<serde_json::Value>, GovernanceError> {
        if self.record.success {
            Ok(self.command.result().cloned())
        } else {
            Err(GovernanceError::ExecutionFailed {
                command_id: self.command.id,
                reason: self.record.error.unwrap_or_default(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Dispatched(DispatchOutcome),
    AwaitingConfirmation(ConfirmationRequest),
    Previewed(Preview),
}

#[derive(Debug)]
struct PendingConfirmation {
    command: Command,
    assessment: RiskAssessment,
    capability: String,
    trace: StateTrace,
    config: Arc<GovernanceConfig>,
    expires_at: Option<DateTime<Utc>>,
}

pub struct ExecutionGateway {
    scorer: RiskScorer,
    executor: Arc<dyn ActionExecutor>,
    logger: ExecutionLogger,
    state: Arc<GovernanceState>,
    pending: Mutex<HashMap<ConfirmationToken, PendingConfirmation>>,
}

impl ExecutionGateway {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        logger: ExecutionLogger,
        state: Arc<GovernanceState>,
    ) -> Self {
        Self {
            scorer: RiskScorer::new(),
            executor,
            logger,
            state,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> &Arc<GovernanceState> {
        &self.state
    }

    pub fn logger(&self) -> &ExecutionLogger {
        &self.logger
    }

    pub fn evaluate(
        &self,
        command: Command,
        ctx: &EvaluationContext,
        mode: GatewayMode,
    ) -> Result<GatewayDecision, GovernanceError> {
        self.evaluate_with(command, ctx, &EvaluateOptions::new(mode))
    }

    /// Scores, authorizes and gates one command. Never dispatches.
    pub fn evaluate_with(
        &self,
        mut command: Command,
        ctx: &EvaluationContext,
        options: &EvaluateOptions,
    ) -> Result<GatewayDecision, GovernanceError> {
        command.validate()?;
        for modifier in &options.modifiers {
            modifier.validate()?;
        }
        let mut trace = StateTrace::new();

        let assessment = self.scorer.score_with(&command, ctx, &options.modifiers);
        command.risk_level = Some(assessment.level);
        command.trust_snapshot = Some(ctx.trust_score);
        trace.advance(GatewayState::RiskScored)?;

        let registry = CapabilityRegistry::from_rules(&ctx.config.policy)?;
        let capability = match registry.authorize(&command, &ctx.principal) {
            PolicyDecision::Allow { capability } => capability,
            PolicyDecision::Deny { reason } => {
                trace.advance(GatewayState::Rejected)?;
                command.set_status(CommandStatus::Rejected)?;
                tracing::warn!(
                    command_id = %command.id,
                    intent = %command.intent,
                    principal = %ctx.principal.name,
                    %reason,
                    "policy denied command"
                );
                return Err(GovernanceError::PolicyDenied {
                    intent: command.intent,
                    reason: reason.to_string(),
                });
            }
        };
        trace.advance(GatewayState::PolicyChecked)?;

        let covered = options
            .approved_ceiling
            .filter(|ceiling| assessment.level != RiskLevel::Critical && assessment.level <= *ceiling);
        let needs_confirmation = assessment.requires_confirmation && covered.is_none();

        if options.mode == GatewayMode::DryRun {
            if !needs_confirmation {
                trace.advance(GatewayState::AutoApproved)?;
            }
            trace.advance(GatewayState::Previewed)?;
            tracing::debug!(command_id = %command.id, risk = ?assessment.level, "dry-run previewed");
            return Ok(GatewayDecision::Previewed(Preview::new(
                command,
                assessment,
                capability,
                needs_confirmation,
                trace,
            )));
        }

        if needs_confirmation {
            trace.advance(GatewayState::AwaitingConfirmation)?;
            command.set_status(CommandStatus::AwaitingConfirmation)?;
            let token = ConfirmationToken::new();
            let requested_at = Utc::now();
            let expires_at = match ctx.config.confirmation_timeout {
                ConfirmationTimeout::None => None,
                ConfirmationTimeout::ExpireAfter { secs } => i64::try_from(secs)
                    .ok()
                    .and_then(ChronoDuration::try_seconds)
                    .and_then(|ttl| requested_at.checked_add_signed(ttl)),
            };
            let preview = Preview::new(
                command.clone(),
                assessment.clone(),
                capability.clone(),
                true,
                trace.clone(),
            );
            tracing::info!(
                command_id = %command.id,
                %token,
                risk = ?assessment.level,
                "awaiting confirmation"
            );
            self.pending.lock().insert(
                token,
                PendingConfirmation {
                    command,
                    assessment,
                    capability,
                    trace,
                    config: Arc::clone(&ctx.config),
                    expires_at,
                },
            );
            return Ok(GatewayDecision::AwaitingConfirmation(ConfirmationRequest {
                token,
                preview,
                requested_at,
                expires_at,
            }));
        }

        trace.advance(GatewayState::AutoApproved)?;
        command.set_status(CommandStatus::Approved)?;
        let approval = match covered {
            Some(ceiling) if assessment.requires_confirmation => Approval::PlanCeiling { ceiling },
            _ => Approval::Automatic,
        };
        Ok(GatewayDecision::Approved(ApprovedCommand {
            command,
            assessment,
            capability,
            approval,
            trace,
            config: Arc::clone(&ctx.config),
        }))
    }

    pub fn resolve(
        &self,
        token: ConfirmationToken,
        decision: Decision,
    ) -> Result<Resolution, GovernanceError> {
        self.resolve_at(token, decision, Utc::now())
    }

    /// Resolve against an explicit clock reading. Expired confirmations are
    /// rejected whatever the decision.
    pub fn resolve_at(
        &self,
        token: ConfirmationToken,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<Resolution, GovernanceError> {
        let pending = self
            .pending
            .lock()
            .remove(&token)
            .ok_or(GovernanceError::UnknownConfirmation(token))?;
        let PendingConfirmation {
            mut command,
            assessment,
            capability,
            mut trace,
            config,
            expires_at,
        } = pending;

        if expires_at.is_some_and(|deadline| now > deadline) {
            trace.advance(GatewayState::Rejected)?;
            command.set_status(CommandStatus::Rejected)?;
            tracing::info!(command_id = %command.id, %token, "confirmation expired");
            return Err(GovernanceError::ConfirmationExpired(token));
        }

        match decision {
            Decision::Approve => {
                trace.advance(GatewayState::Approved)?;
                command.set_status(CommandStatus::Approved)?;
                self.state.record_confirmation(true);
                tracing::info!(command_id = %command.id, %token, "confirmation approved");
                Ok(Resolution::Approved(ApprovedCommand {
                    command,
                    assessment,
                    capability,
                    approval: Approval::Confirmed,
                    trace,
                    config,
                }))
            }
            Decision::Deny => {
                trace.advance(GatewayState::Rejected)?;
                command.set_status(CommandStatus::Rejected)?;
                self.state.record_confirmation(false);
                tracing::info!(command_id = %command.id, %token, "confirmation denied");
                Ok(Resolution::Rejected(command))
            }
        }
    }

    /// Withdraw a pending confirmation. The command ends `Rejected`.
    pub fn cancel(&self, token: ConfirmationToken) -> Result<Command, GovernanceError> {
        let mut pending = self
            .pending
            .lock()
            .remove(&token)
            .ok_or(GovernanceError::UnknownConfirmation(token))?;
        pending.trace.advance(GatewayState::Rejected)?;
        pending.command.set_status(CommandStatus::Rejected)?;
        tracing::info!(command_id = %pending.command.id, %token, "confirmation cancelled");
        Ok(pending.command)
    }

    pub fn pending(&self) -> Vec<ConfirmationToken> {
        let mut tokens: Vec<_> = self.pending.lock().keys().copied().collect();
        tokens.sort();
        tokens
    }

    /// Drops every confirmation past its deadline as rejected.
    pub fn reject_expired(&self, now: DateTime<Utc>) -> Vec<ExpiredConfirmation> {
        let expired: Vec<(ConfirmationToken, PendingConfirmation)> = {
            let mut guard = self.pending.lock();
            let tokens: Vec<ConfirmationToken> = guard
                .iter()
                .filter(|(_, p)| p.expires_at.is_some_and(|deadline| now > deadline))
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| guard.remove(&token).map(|p| (token, p)))
                .collect()
        };

        let mut swept = Vec::with_capacity(expired.len());
        for (token, pending) in expired {
            let PendingConfirmation {
                mut command,
                mut trace,
                ..
            } = pending;
            // AwaitingConfirmation -> Rejected is always legal
            if let Err(e) = trace.advance(GatewayState::Rejected) {
                tracing::error!(command_id = %command.id, %token, error = %e, "expired confirmation left in bad state");
                continue;
            }
            if let Err(e) = command.set_status(CommandStatus::Rejected) {
                tracing::error!(command_id = %command.id, %token, error = %e, "expired confirmation left in bad state");
                continue;
            }
            tracing::info!(command_id = %command.id, %token, "confirmation expired");
            swept.push(ExpiredConfirmation { token, command, trace });
        }
        swept
    }

    /// Captures state, runs the executor under the step timeout and appends
    /// the execution record. Capture or write failures are irrecoverable.
    pub async fn dispatch(&self, approved: ApprovedCommand) -> Result<DispatchOutcome, GovernanceError> {
        let ApprovedCommand {
            mut command,
            mut trace,
            config,
            ..
        } = approved;

        let before = self.logger.capture_before(&command).await.map_err(|e| {
            tracing::error!(command_id = %command.id, error = %e, "before-state capture failed; not dispatching");
            e
        })?;

        trace.advance(GatewayState::Dispatched)?;
        command.set_status(CommandStatus::Executing)?;
        tracing::info!(command_id = %command.id, intent = %command.intent, "dispatching");

        let request = ActionRequest::new(command.id, command.intent.clone(), command.entities.clone());
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            Duration::from_millis(config.step_timeout_ms),
            self.executor.execute(request),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(command_id = %command.id, timeout_ms = config.step_timeout_ms, "executor timed out");
                ActionOutcome::failure(format!("timed out after {} ms", config.step_timeout_ms))
            }
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let record = match self.record(&command, before, &outcome, elapsed_ms).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(command_id = %command.id, error = %e, "execution record could not be written");
                return Err(e);
            }
        };

        if outcome.success {
            trace.advance(GatewayState::Completed)?;
            command.complete(outcome.result)?;
        } else {
            trace.advance(GatewayState::Failed)?;
            command.fail(outcome.error.unwrap_or_else(|| "executor reported failure".into()))?;
        }
        self.state.record_command(outcome.success);
        tracing::info!(
            command_id = %command.id,
            record_id = %record.record_id,
            success = record.success,
            elapsed_ms,
            "dispatch finished"
        );
        Ok(DispatchOutcome {
            command,
            record,
            trace,
        })
    }

    async fn record(
        &self,
        command: &Command,
        before: StateSnapshot,
        outcome: &ActionOutcome,
        elapsed_ms: u64,
    ) -> Result<ExecutionRecord, GovernanceError> {
        let after = self.logger.capture_after(command, outcome).await?;
        Ok(self
            .logger
            .log_execution(command, before, after, outcome.success, elapsed_ms)
            .await?)
    }

    /// Evaluate, then dispatch when approved.
    pub async fn submit(
        &self,
        command: Command,
        ctx: &EvaluationContext,
        mode: GatewayMode,
    ) -> Result<SubmitOutcome, GovernanceError> {
        match self.evaluate(command, ctx, mode)? {
            GatewayDecision::Approved(approved) => Ok(SubmitOutcome::Dispatched(self.dispatch(approved).await?)),
            GatewayDecision::AwaitingConfirmation(request) => Ok(SubmitOutcome::AwaitingConfirmation(request)),
            GatewayDecision::Previewed(preview) => Ok(SubmitOutcome::Previewed(preview)),
        }
    }

    /// Replays a record's rollback instructions through the full gateway.
    pub async fn apply_rollback(
        &self,
        record: &ExecutionRecord,
        ctx: &EvaluationContext,
    ) -> Result<Vec<SubmitOutcome>, GovernanceError> {
        if record.rollback.irreversible {
            return Err(ValidationError::Irreversible(record.record_id.to_string()).into());
        }
        self.state.record_rollback();
        tracing::info!(
            record_id = %record.record_id,
            steps = record.rollback.instructions.len(),
            "applying rollback"
        );
        let mut outcomes = Vec::with_capacity(record.rollback.instructions.len());
        for instruction in &record.rollback.instructions {
            let command = Command::new(instruction.intent.clone())
                .with_entities(instruction.entities.clone())
                .with_raw_input(format!("rollback {}: {}", record.record_id, instruction.description));
            outcomes.push(self.submit(command, ctx, GatewayMode::Execute).await?);
        }
        Ok(outcomes)
    }
}

impl fmt::Debug for ExecutionGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGateway")
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}
