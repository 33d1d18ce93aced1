//! Command & risk model.
//!
//! The canonical action record that flows through the governance pipeline,
//! plus the risk vocabulary shared by every other module.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Entity map supplied by the upstream intent extractor. Keys are unique and
/// iterate in a stable order so that signatures and hashes are reproducible.
pub type Entities = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discrete risk bucket. Ordering follows severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Safe,
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    /// One bucket up, saturating at `Critical`.
    #[must_use]
    pub fn escalate(self) -> Self {
        match self {
            RiskLevel::Safe => RiskLevel::Low,
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission strictness. Each mode fixes the lowest bucket that needs a
/// human confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Confirm MEDIUM and above
    #[default]
    Strict,
    /// Confirm HIGH and above
    Moderate,
    /// Confirm CRITICAL only
    Relaxed,
}

impl PermissionMode {
    pub fn confirmation_floor(self) -> RiskLevel {
        match self {
            PermissionMode::Strict => RiskLevel::Medium,
            PermissionMode::Moderate => RiskLevel::High,
            PermissionMode::Relaxed => RiskLevel::Critical,
        }
    }

    pub fn requires_confirmation(self, level: RiskLevel) -> bool {
        level == RiskLevel::Critical || level >= self.confirmation_floor()
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(PermissionMode::Strict),
            "moderate" => Ok(PermissionMode::Moderate),
            "relaxed" => Ok(PermissionMode::Relaxed),
            other => Err(ValidationError::Malformed(format!(
                "unknown permission mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    AwaitingConfirmation,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Rejected
        )
    }
}

/// One requested action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub created_at: DateTime<Utc>,
    pub raw_input: String,
    pub intent: String,
    pub entities: Entities,
    pub confidence: f64,
    /// Bucket assigned by the risk scorer; `None` until scored.
    pub risk_level: Option<RiskLevel>,
    /// Trust score at evaluation time; `None` until scored.
    pub trust_snapshot: Option<f64>,
    status: CommandStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl Command {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            id: CommandId::new(),
            created_at: Utc::now(),
            raw_input: String::new(),
            intent: intent.into(),
            entities: Entities::new(),
            confidence: 1.0,
            risk_level: None,
            trust_snapshot: None,
            status: CommandStatus::Pending,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_raw_input(mut self, raw: impl Into<String>) -> Self {
        self.raw_input = raw.into();
        self
    }

    #[must_use]
    pub fn with_entity(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.entities.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_entities(mut self, entities: Entities) -> Self {
        self.entities = entities;
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Structural checks performed before scoring.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.intent.trim().is_empty() {
            return Err(ValidationError::Malformed("command has an empty intent".into()));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::Malformed(format!(
                "confidence {} outside 0.0..=1.0",
                self.confidence
            )));
        }
        if self.status != CommandStatus::Pending {
            return Err(ValidationError::Malformed(format!(
                "command {} already in status {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Move to a new status. Terminal statuses are immutable.
    pub fn set_status(&mut self, to: CommandStatus) -> Result<(), ValidationError> {
        if self.status.is_terminal() {
            return Err(ValidationError::TerminalCommand {
                command_id: self.id,
                status: self.status,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn complete(&mut self, result: Option<serde_json::Value>) -> Result<(), ValidationError> {
        self.set_status(CommandStatus::Completed)?;
        self.result = result;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), ValidationError> {
        self.set_status(CommandStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Stable `intent(params)` signature used by loop detection.
    pub fn signature(&self) -> String {
        signature(&self.intent, &self.entities)
    }
}

pub(crate) fn signature(intent: &str, entities: &Entities) -> String {
    let params = serde_json::to_string(entities).unwrap_or_default();
    format!("{intent}{params}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalate_saturates_at_critical() {
        assert_eq!(RiskLevel::Medium.escalate(), RiskLevel::High);
        assert_eq!(RiskLevel::Critical.escalate(), RiskLevel::Critical);
    }

    #[test]
    fn permission_modes_map_to_floors() {
        assert!(PermissionMode::Strict.requires_confirmation(RiskLevel::Medium));
        assert!(!PermissionMode::Relaxed.requires_confirmation(RiskLevel::Medium));
        assert!(!PermissionMode::Moderate.requires_confirmation(RiskLevel::Medium));
        assert!(PermissionMode::Moderate.requires_confirmation(RiskLevel::High));
        for mode in [PermissionMode::Strict, PermissionMode::Moderate, PermissionMode::Relaxed] {
            assert!(mode.requires_confirmation(RiskLevel::Critical));
            assert!(!mode.requires_confirmation(RiskLevel::Safe));
        }
    }

    #[test]
    fn terminal_status_is_immutable() {
        let mut cmd = Command::new("get_time");
        cmd.complete(Some(serde_json::json!("12:00"))).unwrap();
        assert!(cmd.set_status(CommandStatus::Executing).is_err());
        assert!(cmd.fail("late").is_err());
        assert_eq!(cmd.status(), CommandStatus::Completed);
    }

    #[test]
    fn validate_rejects_bad_confidence() {
        assert!(Command::new("x").with_confidence(1.5).validate().is_err());
        assert!(Command::new("x").with_confidence(f64::NAN).validate().is_err());
        assert!(Command::new("  ").validate().is_err());
        assert!(Command::new("x").with_confidence(0.0).validate().is_ok());
    }

    #[test]
    fn serialized_command_keeps_null_fields() {
        let cmd = Command::new("get_time");
        let json = serde_json::to_value(&cmd).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.get("error").unwrap().is_null());
        assert!(obj.get("result").unwrap().is_null());
        assert!(obj.get("risk_level").unwrap().is_null());
    }

    #[test]
    fn signature_is_order_independent() {
        let a = Command::new("move_file").with_entity("source", "a").with_entity("destination", "b");
        let b = Command::new("move_file").with_entity("destination", "b").with_entity("source", "a");
        assert_eq!(a.signature(), b.signature());
    }
}
