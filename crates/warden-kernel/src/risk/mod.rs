//! Risk scoring.
//!
//! # Composition
//!
//! Every factor is a multiplier in `(0, ∞)` where `1.0` means no effect:
//!
//! ```text
//! score = clamp(base × trust × confidence × path × executable × modifiers…, 0, 1)
//! ```
//!
//! A reassuring factor can never average away a dangerous one. The scorer
//! reads nothing but its arguments, so identical inputs always produce an
//! identical [`RiskAssessment`].

use crate::context::EvaluationContext;
use crate::error::ValidationError;
use crate::types::{Command, RiskLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Built-in base risk per intent. Config `intent_risks` entries override or
/// extend this table.
pub const BUILTIN_INTENT_RISKS: &[(&str, f64)] = &[
    ("shutdown_system", 1.0),
    ("restart_system", 1.0),
    ("delete_system_file", 1.0),
    ("format_drive", 1.0),
    ("install_system", 0.95),
    ("modify_registry", 0.9),
    ("delete_folder", 0.85),
    ("delete_file", 0.8),
    ("uninstall", 0.8),
    ("run_script", 0.75),
    ("install_application", 0.7),
    ("modify_file", 0.6),
    ("write_file", 0.6),
    ("move_file", 0.55),
    ("create_file", 0.5),
    ("rename_file", 0.5),
    ("create_folder", 0.45),
    ("copy_file", 0.4),
    ("open_application", 0.3),
    ("close_application", 0.3),
    ("read_file", 0.2),
    ("search", 0.1),
    ("get_weather", 0.1),
    ("get_time", 0.05),
    ("help", 0.0),
    ("status", 0.0),
    ("list", 0.0),
];

/// Entity keys that name a filesystem target.
pub const PATH_ENTITY_KEYS: &[&str] = &[
    "path",
    "filename",
    "file",
    "folder",
    "source",
    "destination",
    "target",
];

pub const EXECUTABLE_EXTENSIONS: &[&str] = &[".exe", ".dll", ".sys", ".bat", ".ps1", ".sh"];

pub const PATH_SENSITIVITY_WEIGHT: f64 = 1.5;
pub const EXECUTABLE_TARGET_WEIGHT: f64 = 1.3;
pub const LATE_NIGHT_WEIGHT: f64 = 1.2;

/// One contributing factor. `weight` is the multiplier, `value` the input
/// that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub weight: f64,
    pub value: Value,
}

impl RiskFactor {
    pub fn new(name: impl Into<String>, weight: f64, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            weight,
            value: value.into(),
        }
    }

    /// Hour-of-day modifier. The caller supplies the hour; the scorer never
    /// reads a clock.
    pub fn late_night(hour: u32) -> Self {
        let weight = if hour >= 23 || hour < 6 { LATE_NIGHT_WEIGHT } else { 1.0 };
        Self::new("late_night", weight, hour)
    }

    /// A weight of zero or below would erase every other factor.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.weight.is_finite() && self.weight > 0.0 {
            Ok(())
        } else {
            Err(ValidationError::InvalidRiskFactor {
                name: self.name.clone(),
                weight: self.weight,
            })
        }
    }

    /// Recent error-rate modifier: `1 + error_rate × 0.5`.
    pub fn error_history(error_rate: f64) -> Self {
        let rate = error_rate.clamp(0.0, 1.0);
        Self::new("error_history", 1.0 + rate * 0.5, rate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
    pub requires_confirmation: bool,
    /// Config snapshot the assessment was computed against
    pub config_version: u64,
}

impl RiskAssessment {
    /// Human-readable summary used in previews.
    pub fn explain(&self) -> String {
        let drivers: Vec<String> = self
            .factors
            .iter()
            .filter(|f| (f.weight - 1.0).abs() > f64::EPSILON || f.name == "base_intent")
            .map(|f| format!("{}={:.2}", f.name, f.weight))
            .collect();
        format!(
            "{} risk ({:.2}): {}",
            self.level,
            self.score,
            drivers.join(", ")
        )
    }
}

/// Stateless scorer; every input arrives through its arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskScorer;

impl RiskScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, command: &Command, ctx: &EvaluationContext) -> RiskAssessment {
        self.score_with(command, ctx, &[])
    }

    /// Score with extra caller-supplied modifiers multiplied in last.
    ///
    /// A modifier outside `(0, ∞)` scores the command CRITICAL; callers
    /// should reject such modifiers with [`RiskFactor::validate`] first.
    pub fn score_with(
        &self,
        command: &Command,
        ctx: &EvaluationContext,
        modifiers: &[RiskFactor],
    ) -> RiskAssessment {
        let config = &ctx.config;
        if let Some(bad) = modifiers.iter().find(|m| m.validate().is_err()) {
            return RiskAssessment {
                score: 1.0,
                level: RiskLevel::Critical,
                factors: vec![RiskFactor::new("invalid_modifier", 1.0, bad.name.clone())],
                requires_confirmation: true,
                config_version: config.version,
            };
        }
        let Some(base) = base_risk(&command.intent, ctx) else {
            return RiskAssessment {
                score: 1.0,
                level: RiskLevel::Critical,
                factors: vec![RiskFactor::new(
                    "unregistered_intent",
                    1.0,
                    command.intent.clone(),
                )],
                requires_confirmation: true,
                config_version: config.version,
            };
        };

        let mut factors = vec![RiskFactor::new("base_intent", base, command.intent.clone())];
        factors.push(RiskFactor::new(
            "trust_penalty",
            trust_penalty(ctx.trust_score),
            ctx.trust_score,
        ));
        factors.push(RiskFactor::new(
            "confidence",
            confidence_factor(command.confidence),
            command.confidence,
        ));
        if let Some(path) = protected_target(command, &config.protected_paths) {
            factors.push(RiskFactor::new("path_sensitivity", PATH_SENSITIVITY_WEIGHT, path));
        }
        if let Some(target) = executable_target(command) {
            factors.push(RiskFactor::new("executable_target", EXECUTABLE_TARGET_WEIGHT, target));
        }
        factors.extend(modifiers.iter().cloned());

        let product = factors.iter().fold(1.0_f64, |acc, f| acc * f.weight);
        let score = if product.is_finite() { product.clamp(0.0, 1.0) } else { 1.0 };
        let level = config.thresholds.level_for(score);

        RiskAssessment {
            score,
            level,
            factors,
            requires_confirmation: ctx.permission_mode.requires_confirmation(level),
            config_version: config.version,
        }
    }
}

/// Config override first, then the built-in table.
pub fn base_risk(intent: &str, ctx: &EvaluationContext) -> Option<f64> {
    ctx.config.intent_risks.get(intent).copied().or_else(|| {
        BUILTIN_INTENT_RISKS
            .iter()
            .find(|(name, _)| *name == intent)
            .map(|(_, risk)| *risk)
    })
}

/// Low trust raises risk; high trust never lowers it below the base.
fn trust_penalty(trust: f64) -> f64 {
    1.0 + (0.5 - trust.clamp(0.0, 1.0)).max(0.0) * 0.8
}

fn confidence_factor(confidence: f64) -> f64 {
    1.0 + (1.0 - confidence.clamp(0.0, 1.0)) * 0.5
}

fn string_values<'a>(
    command: &'a Command,
    keys: Option<&'a [&'a str]>,
) -> impl Iterator<Item = &'a str> + 'a {
    command
        .entities
        .iter()
        .filter(move |(k, _)| keys.map_or(true, |keys| keys.contains(&k.as_str())))
        .filter_map(|(_, v)| v.as_str())
}

fn protected_target(command: &Command, protected: &[String]) -> Option<String> {
    string_values(command, Some(PATH_ENTITY_KEYS))
        .find(|value| protected.iter().any(|prefix| is_under(value, prefix)))
        .map(String::from)
}

/// Case-insensitive prefix match on a path-component boundary.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let path = path.to_lowercase();
    let prefix = prefix.to_lowercase();
    let prefix = prefix.trim_end_matches(['/', '\\']);
    if prefix.is_empty() {
        return false;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\'),
        None => false,
    }
}

fn executable_target(command: &Command) -> Option<String> {
    string_values(command, None)
        .find(|value| {
            let lower = value.to_lowercase();
            EXECUTABLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
        })
        .map(String::from)
}
