//! Whole-plan risk.
//!
//! `score = clamp(max(step scores) × 1.05^(n-1), 0, 1)`, so a longer plan is
//! never judged safer than its riskiest step. If any step is HIGH or
//! CRITICAL the bucket is raised by one more level.

use crate::context::EvaluationContext;
use crate::risk::{RiskAssessment, RiskScorer};
use crate::types::RiskLevel;
use crate::workflow::{StepId, Workflow};
use serde::{Deserialize, Serialize};

/// Per additional step multiplier.
pub const STEP_COUNT_GROWTH: f64 = 1.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRisk {
    pub step: StepId,
    pub order: usize,
    pub assessment: RiskAssessment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    /// Raised one bucket because a step is HIGH or CRITICAL
    pub escalated: bool,
    pub requires_confirmation: bool,
    pub steps: Vec<StepRisk>,
}

impl WorkflowRiskAssessment {
    pub fn max_step_level(&self) -> RiskLevel {
        self.steps
            .iter()
            .map(|s| s.assessment.level)
            .max()
            .unwrap_or(RiskLevel::Safe)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowRiskAggregator {
    scorer: RiskScorer,
}

impl WorkflowRiskAggregator {
    pub fn new() -> Self {
        Self {
            scorer: RiskScorer::new(),
        }
    }

    pub fn aggregate(&self, workflow: &Workflow, ctx: &EvaluationContext) -> WorkflowRiskAssessment {
        let steps: Vec<StepRisk> = workflow
            .steps()
            .iter()
            .map(|step| StepRisk {
                step: step.id.clone(),
                order: step.order,
                assessment: self.scorer.score(&step.template.instantiate(), ctx),
            })
            .collect();

        let max_score = steps
            .iter()
            .map(|s| s.assessment.score)
            .fold(0.0_f64, f64::max);
        let extra_steps = i32::try_from(steps.len().saturating_sub(1)).unwrap_or(i32::MAX);
        let score = (max_score * STEP_COUNT_GROWTH.powi(extra_steps)).clamp(0.0, 1.0);

        let escalated = steps.iter().any(|s| s.assessment.level >= RiskLevel::High);
        let base = ctx.config.thresholds.level_for(score);
        let level = if escalated { base.escalate() } else { base };

        let requires_confirmation = ctx.permission_mode.requires_confirmation(level)
            || level >= ctx.config.workflow_confirmation_level;

        WorkflowRiskAssessment {
            score,
            level,
            escalated,
            requires_confirmation,
            steps,
        }
    }
}
