//! Error taxonomy for the governance core
//!
//! Provides error handling for:
//! - Malformed commands and workflows (rejected before scoring)
//! - Capability policy denials
//! - Risk blocks pending human decision
//! - Plan-level aborts (cycles, failed dependencies)
//! - Audit write failures, which are fatal to the pipeline

use crate::gateway::ConfirmationToken;
use crate::types::{CommandId, CommandStatus, RiskLevel};

/// Main governance error type
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// Malformed command or workflow
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Capability check failed
    #[error("policy denied '{intent}': {reason}")]
    PolicyDenied { intent: String, reason: String },

    /// Risk exceeded the approved ceiling; waits for an explicit decision
    #[error("risk {level} exceeds approved ceiling {ceiling}")]
    RiskBlocked {
        level: RiskLevel,
        ceiling: RiskLevel,
        token: Option<ConfirmationToken>,
    },

    /// Loop prevention triggered
    #[error("cyclic plan: step '{step}' repeats {signature}")]
    CyclicPlan { step: String, signature: String },

    /// A prerequisite step did not succeed
    #[error("step '{step}' skipped: dependency '{dependency}' failed")]
    DependencyFailed { step: String, dependency: String },

    /// Downstream collaborator reported failure
    #[error("execution of {command_id} failed: {reason}")]
    ExecutionFailed { command_id: CommandId, reason: String },

    /// Audit capture or write failed
    #[error("irrecoverable audit failure: {0}")]
    Irrecoverable(#[from] AuditError),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Workflow persistence failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Confirmation token unknown or already resolved
    #[error("no pending confirmation for token {0}")]
    UnknownConfirmation(ConfirmationToken),

    /// Confirmation expired under the configured timeout policy
    #[error("confirmation {0} expired and was rejected")]
    ConfirmationExpired(ConfirmationToken),

    /// Gateway attempted an illegal transition
    #[error("state machine error: {0}")]
    IllegalTransition(#[from] StateMachineError),

    /// Cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,
}

impl GovernanceError {
    /// Terminal errors end the command or plan; the rest wait or continue.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RiskBlocked { .. })
    }

    /// Only audit failures stop the whole pipeline.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Irrecoverable(_))
    }

    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::RiskBlocked { .. })
    }
}

/// Construction and input validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("command {command_id} is terminal ({status:?}) and cannot change")]
    TerminalCommand {
        command_id: CommandId,
        status: CommandStatus,
    },

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step orders must be contiguous from 0: expected {expected}, found {found}")]
    NonContiguousOrder { expected: usize, found: usize },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' depends on '{dependency}' which is not an earlier step")]
    ForwardDependency { step: String, dependency: String },

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("plan has {steps} steps, limit is {limit}")]
    PlanTooLong { steps: usize, limit: usize },

    #[error("record {0} is irreversible and cannot be rolled back")]
    Irreversible(String),

    #[error("risk factor '{name}' has weight {weight}; weights must be finite and greater than zero")]
    InvalidRiskFactor { name: String, weight: f64 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("risk thresholds must be strictly increasing within (0, 1]")]
    NonMonotonicThresholds,

    #[error("invalid base risk {value} for intent '{intent}'")]
    InvalidIntentRisk { intent: String, value: f64 },

    #[error("intent '{intent}' already owned by capability '{existing}'")]
    DuplicateIntentOwner { intent: String, existing: String },

    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read configuration: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum AuditError {
    #[error("state capture failed for '{resource}': {reason}")]
    CaptureFailed { resource: String, reason: String },

    #[error("audit write failed: {0}")]
    WriteFailed(String),

    #[error("audit log integrity violation at sequence {0}")]
    IntegrityViolation(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow {0} not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("stored workflow is invalid: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: crate::state_machine::GatewayState,
        to: crate::state_machine::GatewayState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_audit_failures_are_fatal() {
        let fatal = GovernanceError::from(AuditError::WriteFailed("disk full".into()));
        assert!(fatal.is_fatal());
        let denied = GovernanceError::PolicyDenied {
            intent: "format_drive".into(),
            reason: "denied".into(),
        };
        assert!(!denied.is_fatal());
        assert!(denied.is_terminal());
    }

    #[test]
    fn risk_block_waits_for_human() {
        let blocked = GovernanceError::RiskBlocked {
            level: RiskLevel::Critical,
            ceiling: RiskLevel::Medium,
            token: None,
        };
        assert!(blocked.requires_human());
        assert!(!blocked.is_terminal());
    }
}
