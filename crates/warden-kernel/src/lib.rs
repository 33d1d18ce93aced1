//! Warden Kernel (warden-kernel)
//!
//! Risk governance for structured actions and multi-step plans:
//! 1. **Scoring**: a pure, multiplicative risk model per command
//! 2. **Policy**: binary capability rights, deny by default
//! 3. **Gating**: auto-approve, two-phase confirmation, or dry-run preview
//! 4. **Orchestration**: re-verified step execution with loop prevention
//! 5. **Audit**: before/after capture and rollback bookkeeping per dispatch
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use warden_kernel::prelude::*;
//!
//! let state = Arc::new(GovernanceState::default());
//! let (logger, audit) = ExecutionLogger::in_memory();
//! let gateway = ExecutionGateway::new(Arc::new(HandlerExecutor::with_builtins()), logger, state.clone());
//!
//! let cmd = Command::new("get_time").with_confidence(0.9);
//! match gateway.evaluate(cmd, &state.snapshot(), GatewayMode::Execute)? {
//!     GatewayDecision::Approved(approved) => { gateway.dispatch(approved).await?; }
//!     GatewayDecision::AwaitingConfirmation(req) => { gateway.resolve(req.token, Decision::Approve)?; }
//!     GatewayDecision::Previewed(_) => {}
//! }
//! ```

pub mod aggregate;
pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod orchestrator;
pub mod policy;
pub mod risk;
pub mod state_machine;
pub mod types;
pub mod workflow;

// Re-exports
pub use error::*;
pub use types::*;

pub mod prelude {
    pub use crate::aggregate::{WorkflowRiskAggregator, WorkflowRiskAssessment};
    pub use crate::audit::{
        AuditSink, ExecutionLogger, ExecutionRecord, FsProbe, JsonlAuditLog, MemoryAuditLog, NullProbe, Rollback,
        StateProbe, StateSnapshot,
    };
    pub use crate::config::{FailurePolicy, GovernanceConfig, LoopDetection, RepeatMatching, RiskThresholds};
    pub use crate::context::{EvaluationContext, GovernanceState};
    pub use crate::error::{GovernanceError, ValidationError};
    pub use crate::executor::{ActionExecutor, ActionOutcome, ActionRequest, HandlerExecutor, ResourceChange};
    pub use crate::gateway::{
        ApprovedCommand, ConfirmationToken, Decision, ExecutionGateway, GatewayDecision, GatewayMode, Resolution,
        SubmitOutcome,
    };
    pub use crate::orchestrator::{
        Orchestrator, PlanApproval, PlanCancellation, PlanReport, PlanStatus, Planner, StepStatus,
    };
    pub use crate::policy::{CapabilityRegistry, PolicyDecision, PolicyRules, Principal};
    pub use crate::risk::{RiskAssessment, RiskFactor, RiskScorer};
    pub use crate::types::{Command, CommandStatus, PermissionMode, RiskLevel};
    pub use crate::workflow::{CommandTemplate, Workflow, WorkflowBuilder, WorkflowStep, WorkflowStore};
    pub use std::sync::Arc;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
