//! Governance configuration surface.
//!
//! Every field is defaulted so a partial YAML document is valid. A loaded
//! config is validated once and then shared read-only through
//! [`EvaluationContext`](crate::context::EvaluationContext) snapshots.

use crate::error::ConfigError;
use crate::policy::PolicyRules;
use crate::types::{PermissionMode, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Lower bounds of the LOW..CRITICAL buckets. Anything below `low` is SAFE.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 0.1,
            medium: 0.35,
            high: 0.65,
            critical: 0.9,
        }
    }
}

impl RiskThresholds {
    pub fn level_for(&self, score: f64) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else if score >= self.low {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [self.low, self.medium, self.high, self.critical];
        let finite = bounds.iter().all(|b| b.is_finite() && *b > 0.0 && *b <= 1.0);
        let increasing = bounds.windows(2).all(|w| w[0] < w[1]);
        if finite && increasing {
            Ok(())
        } else {
            Err(ConfigError::NonMonotonicThresholds)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMatching {
    /// Same intent and identical parameters
    #[default]
    Exact,
    /// Same intent regardless of parameters
    IntentOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetection {
    /// Repeats tolerated before the plan is rejected as cyclic
    pub repeat_bound: u32,
    pub matching: RepeatMatching,
}

/// What happens to a confirmation nobody answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationTimeout {
    /// Stays pending until resolved or cancelled
    #[default]
    None,
    /// Rejected once older than this
    ExpireAfter { secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep running steps that do not depend on the failed one
    #[default]
    ContinueIndependent,
    /// Abort the remainder of the plan
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub version: u64,
    pub permission_mode: PermissionMode,
    pub thresholds: RiskThresholds,
    /// Merged over the built-in intent table
    pub intent_risks: BTreeMap<String, f64>,
    pub protected_paths: Vec<String>,
    pub loop_detection: LoopDetection,
    pub confirmation_timeout: ConfirmationTimeout,
    pub step_timeout_ms: u64,
    pub risk_budget: f64,
    pub max_plan_steps: usize,
    pub failure_policy: FailurePolicy,
    pub max_consecutive_failures: u32,
    /// Plan-level confirmation floor applied on top of the mode floor
    pub workflow_confirmation_level: RiskLevel,
    pub policy: PolicyRules,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            version: 1,
            permission_mode: PermissionMode::Strict,
            thresholds: RiskThresholds::default(),
            intent_risks: BTreeMap::new(),
            protected_paths: default_protected_paths(),
            loop_detection: LoopDetection::default(),
            confirmation_timeout: ConfirmationTimeout::None,
            step_timeout_ms: 30_000,
            risk_budget: 5.0,
            max_plan_steps: 16,
            failure_policy: FailurePolicy::ContinueIndependent,
            max_consecutive_failures: 2,
            workflow_confirmation_level: RiskLevel::Medium,
            policy: PolicyRules::default(),
        }
    }
}

fn default_protected_paths() -> Vec<String> {
    [
        "/etc",
        "/sys",
        "/proc",
        "/boot",
        "/dev",
        "C:\\Windows",
        "C:\\Program Files",
        "C:\\Program Files (x86)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl GovernanceConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_intent_risk(mut self, intent: impl Into<String>, base: f64) -> Self {
        self.intent_risks.insert(intent.into(), base);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_step_timeout_ms(mut self, ms: u64) -> Self {
        self.step_timeout_ms = ms;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_loop_detection(mut self, loop_detection: LoopDetection) -> Self {
        self.loop_detection = loop_detection;
        self
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let config = Self::from_yaml_str(&raw)?;
        tracing::info!(path = %path.display(), version = config.version, "loaded governance config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        for (intent, value) in &self.intent_risks {
            if !value.is_finite() || *value < 0.0 {
                return Err(ConfigError::InvalidIntentRisk {
                    intent: intent.clone(),
                    value: *value,
                });
            }
        }
        if self.step_timeout_ms == 0 {
            return Err(ConfigError::NonPositive("step_timeout_ms"));
        }
        if self.max_plan_steps == 0 {
            return Err(ConfigError::NonPositive("max_plan_steps"));
        }
        if !(self.risk_budget.is_finite() && self.risk_budget > 0.0) {
            return Err(ConfigError::NonPositive("risk_budget"));
        }
        if let ConfirmationTimeout::ExpireAfter { secs: 0 } = self.confirmation_timeout {
            return Err(ConfigError::NonPositive("confirmation_timeout.secs"));
        }
        self.policy.validate()?;
        Ok(())
    }
}
