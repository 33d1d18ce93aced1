//! Evaluation context and shared governance state.
//!
//! Trust, permission mode and the active config are never looked up from a
//! global. Callers take an immutable [`EvaluationContext`] snapshot from
//! [`GovernanceState`] (or build one directly in tests) and pass it into the
//! scorer, the gateway and the orchestrator.

use crate::config::GovernanceConfig;
use crate::error::ConfigError;
use crate::policy::Principal;
use crate::types::PermissionMode;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Immutable inputs for one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub trust_score: f64,
    pub permission_mode: PermissionMode,
    pub config: Arc<GovernanceConfig>,
    pub principal: Principal,
}

impl EvaluationContext {
    /// Neutral trust, the config's permission mode and its default grants.
    pub fn new(config: Arc<GovernanceConfig>) -> Self {
        let principal = Principal::with_default_grants("local", &config.policy);
        Self {
            trust_score: TrustLedger::NEUTRAL,
            permission_mode: config.permission_mode,
            config,
            principal,
        }
    }

    #[must_use]
    pub fn with_trust_score(mut self, trust: f64) -> Self {
        self.trust_score = trust.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self::new(Arc::new(GovernanceConfig::default()))
    }
}

/// Outcome counters that drive the trust score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustLedger {
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub confirmations_approved: u64,
    pub confirmations_denied: u64,
    pub rollbacks: u64,
}

impl TrustLedger {
    pub const NEUTRAL: f64 = 0.5;

    pub fn trust_score(&self) -> f64 {
        let mut trust = Self::NEUTRAL;
        let confirmations = self.confirmations_approved + self.confirmations_denied;
        if confirmations > 0 {
            trust += ratio(self.confirmations_approved, confirmations) * 0.3;
        }
        let commands = self.successful_commands + self.failed_commands;
        if commands > 0 {
            trust += ratio(self.successful_commands, commands) * 0.2;
            trust -= ratio(self.failed_commands, commands) * 0.3;
        }
        #[allow(clippy::cast_precision_loss)]
        let rollback_penalty = (self.rollbacks as f64 * 0.003).min(0.3);
        (trust - rollback_penalty).clamp(0.0, 1.0)
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, total: u64) -> f64 {
    part as f64 / total as f64
}

/// Process-wide mutable governance state.
///
/// Every read-modify-write happens under a single short lock; no lock is
/// ever held across an await point.
#[derive(Debug)]
pub struct GovernanceState {
    config: RwLock<Arc<GovernanceConfig>>,
    permission_mode: RwLock<PermissionMode>,
    principal: RwLock<Principal>,
    ledger: Mutex<TrustLedger>,
}

impl GovernanceState {
    pub fn new(config: GovernanceConfig) -> Self {
        let principal = Principal::with_default_grants("local", &config.policy);
        Self {
            permission_mode: RwLock::new(config.permission_mode),
            config: RwLock::new(Arc::new(config)),
            principal: RwLock::new(principal),
            ledger: Mutex::new(TrustLedger::default()),
        }
    }

    pub fn snapshot(&self) -> EvaluationContext {
        let trust_score = self.trust_score();
        // Same lock order as `reload_config`: config, mode, principal.
        let config = self.config.read();
        let permission_mode = *self.permission_mode.read();
        let principal = self.principal.read().clone();
        EvaluationContext {
            trust_score,
            permission_mode,
            config: Arc::clone(&config),
            principal,
        }
    }

    pub fn config(&self) -> Arc<GovernanceConfig> {
        Arc::clone(&self.config.read())
    }

    /// Swap in a new config snapshot. Evaluations already holding the old
    /// snapshot are unaffected.
    ///
    /// The permission mode and the default principal are reset from the new
    /// config, replacing any `set_permission_mode` or `set_principal`
    /// override.
    pub fn reload_config(&self, mut config: GovernanceConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let mut guard = self.config.write();
        if config.version <= guard.version {
            config.version = guard.version + 1;
        }
        let version = config.version;
        let mode = config.permission_mode;
        *self.permission_mode.write() = mode;
        *self.principal.write() = Principal::with_default_grants("local", &config.policy);
        *guard = Arc::new(config);
        tracing::info!(version, mode = ?mode, "governance config reloaded");
        Ok(version)
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        *self.permission_mode.write() = mode;
        tracing::info!(mode = ?mode, "permission mode changed");
    }

    pub fn set_principal(&self, principal: Principal) {
        *self.principal.write() = principal;
    }

    pub fn trust_score(&self) -> f64 {
        self.ledger.lock().trust_score()
    }

    pub fn ledger(&self) -> TrustLedger {
        *self.ledger.lock()
    }

    pub fn record_command(&self, success: bool) -> f64 {
        let mut ledger = self.ledger.lock();
        if success {
            ledger.successful_commands += 1;
        } else {
            ledger.failed_commands += 1;
        }
        ledger.trust_score()
    }

    pub fn record_confirmation(&self, approved: bool) -> f64 {
        let mut ledger = self.ledger.lock();
        if approved {
            ledger.confirmations_approved += 1;
        } else {
            ledger.confirmations_denied += 1;
        }
        ledger.trust_score()
    }

    pub fn record_rollback(&self) -> f64 {
        let mut ledger = self.ledger.lock();
        ledger.rollbacks += 1;
        ledger.trust_score()
    }
}

impl Default for GovernanceState {
    fn default() -> Self {
        Self::new(GovernanceConfig::default())
    }
}
