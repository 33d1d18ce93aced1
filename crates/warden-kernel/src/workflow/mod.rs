//! Workflows.
//!
//! A [`Workflow`] can only be obtained through [`WorkflowBuilder::build`] or
//! by deserializing, and both paths run the same construction checks:
//!
//! - step orders are unique and contiguous from 0
//! - step ids are unique
//! - dependencies name existing, strictly earlier steps
//!
//! An invalid plan is rejected here, never at run time.

mod store;

pub use store::{WorkflowStore, WorkflowSummary};

use crate::error::ValidationError;
use crate::types::{Command, Entities, RiskLevel};
use chrono::{DateTime, Utc};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::Malformed(format!("workflow id '{s}': {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Intent plus parameters; becomes a concrete [`Command`] at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub intent: String,
    #[serde(default)]
    pub parameters: Entities,
}

impl CommandTemplate {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            parameters: Entities::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn instantiate(&self) -> Command {
        Command::new(self.intent.clone()).with_entities(self.parameters.clone())
    }

    /// `intent(params)` signature used for loop detection.
    pub fn signature(&self) -> String {
        crate::types::signature(&self.intent, &self.parameters)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub template: CommandTemplate,
    pub order: usize,
    pub description: String,
    pub depends_on: Vec<StepId>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<StepId>, order: usize, template: CommandTemplate) -> Self {
        Self {
            id: id.into(),
            template,
            order,
            description: String::new(),
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// Last computed plan risk. A cache only; always recomputed before running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRisk {
    pub score: f64,
    pub level: RiskLevel,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WorkflowRecord")]
pub struct Workflow {
    id: WorkflowId,
    name: String,
    description: String,
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    tags: Vec<String>,
    steps: Vec<WorkflowStep>,
    cached_risk: Option<CachedRisk>,
}

/// Unvalidated persisted form.
#[derive(Debug, Deserialize)]
struct WorkflowRecord {
    id: WorkflowId,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "first_version")]
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    tags: Vec<String>,
    steps: Vec<WorkflowStep>,
    #[serde(default)]
    cached_risk: Option<CachedRisk>,
}

fn first_version() -> u32 {
    1
}

impl TryFrom<WorkflowRecord> for Workflow {
    type Error = ValidationError;

    fn try_from(raw: WorkflowRecord) -> Result<Self, Self::Error> {
        let steps = validate_steps(raw.steps)?;
        Ok(Self {
            id: raw.id,
            name: raw.name,
            description: raw.description,
            version: raw.version,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            tags: raw.tags,
            steps,
            cached_risk: raw.cached_risk,
        })
    }
}

impl Workflow {
    /// Linear plan where every step depends on the one before it.
    pub fn sequential(
        name: impl Into<String>,
        templates: impl IntoIterator<Item = CommandTemplate>,
    ) -> Result<Self, ValidationError> {
        templates
            .into_iter()
            .enumerate()
            .fold(WorkflowBuilder::new(name), |builder, (i, template)| {
                builder.then(format!("step-{i}"), template)
            })
            .build()
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn cached_risk(&self) -> Option<&CachedRisk> {
        self.cached_risk.as_ref()
    }

    pub fn set_cached_risk(&mut self, score: f64, level: RiskLevel) {
        self.cached_risk = Some(CachedRisk {
            score,
            level,
            computed_at: Utc::now(),
        });
    }

    /// Replace the steps after re-validating them. Bumps the version.
    pub fn revise(&mut self, steps: Vec<WorkflowStep>) -> Result<(), ValidationError> {
        self.steps = validate_steps(steps)?;
        self.version += 1;
        self.updated_at = Utc::now();
        self.cached_risk = None;
        Ok(())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Dependency graph over step orders; an edge points from a
    /// prerequisite to its dependent.
    pub fn dependency_graph(&self) -> DiGraphMap<usize, ()> {
        let by_id: BTreeMap<&StepId, usize> = self.steps.iter().map(|s| (&s.id, s.order)).collect();
        let mut graph = DiGraphMap::new();
        for step in &self.steps {
            graph.add_node(step.order);
            for dep in &step.depends_on {
                if let Some(&from) = by_id.get(dep) {
                    graph.add_edge(from, step.order, ());
                }
            }
        }
        graph
    }
}

fn validate_steps(mut steps: Vec<WorkflowStep>) -> Result<Vec<WorkflowStep>, ValidationError> {
    steps.sort_by_key(|s| s.order);
    let mut orders: BTreeMap<StepId, usize> = BTreeMap::new();
    for (expected, step) in steps.iter().enumerate() {
        if step.order != expected {
            return Err(ValidationError::NonContiguousOrder {
                expected,
                found: step.order,
            });
        }
        if step.template.intent.trim().is_empty() {
            return Err(ValidationError::Malformed(format!("step '{}' has an empty intent", step.id)));
        }
        if orders.insert(step.id.clone(), step.order).is_some() {
            return Err(ValidationError::DuplicateStep(step.id.to_string()));
        }
    }

    for step in &steps {
        let mut seen = BTreeSet::new();
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(ValidationError::SelfDependency(step.id.to_string()));
            }
            let Some(&dep_order) = orders.get(dep) else {
                return Err(ValidationError::UnknownDependency {
                    step: step.id.to_string(),
                    dependency: dep.to_string(),
                });
            };
            if dep_order >= step.order {
                return Err(ValidationError::ForwardDependency {
                    step: step.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
            if !seen.insert(dep) {
                return Err(ValidationError::Malformed(format!(
                    "step '{}' lists dependency '{dep}' twice",
                    step.id
                )));
            }
        }
    }
    Ok(steps)
}

/// Construction-phase builder for [`Workflow`].
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    description: String,
    tags: Vec<String>,
    steps: Vec<WorkflowStep>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a fully specified step, order included.
    #[must_use]
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a step with the next order, independent of the others.
    #[must_use]
    pub fn push(self, id: impl Into<StepId>, template: CommandTemplate) -> Self {
        let order = self.steps.len();
        self.step(WorkflowStep::new(id, order, template))
    }

    /// Append a step with the next order that depends on the previous step.
    #[must_use]
    pub fn then(self, id: impl Into<StepId>, template: CommandTemplate) -> Self {
        let order = self.steps.len();
        let previous = self.steps.last().map(|s| s.id.clone());
        let step = WorkflowStep::new(id, order, template).depends_on(previous);
        self.step(step)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn build(self) -> Result<Workflow, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Malformed("workflow name is empty".into()));
        }
        let steps = validate_steps(self.steps)?;
        let now = Utc::now();
        let workflow = Workflow {
            id: WorkflowId::new(),
            name: self.name,
            description: self.description,
            version: 1,
            created_at: now,
            updated_at: now,
            tags: self.tags,
            steps,
            cached_risk: None,
        };
        debug_assert!(!petgraph::algo::is_cyclic_directed(&workflow.dependency_graph()));
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(intent: &str) -> CommandTemplate {
        CommandTemplate::new(intent)
    }

    #[test]
    fn then_chains_dependencies() {
        let wf = WorkflowBuilder::new("backup")
            .then("mkdir", t("create_folder"))
            .then("move-a", t("move_file"))
            .build()
            .unwrap();
        assert_eq!(wf.steps()[1].depends_on, vec![StepId::from("mkdir")]);
        assert_eq!(wf.dependency_graph().edge_count(), 1);
    }

    #[test]
    fn orders_must_be_contiguous() {
        let err = WorkflowBuilder::new("gap")
            .step(WorkflowStep::new("a", 0, t("get_time")))
            .step(WorkflowStep::new("b", 2, t("get_time")))
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::NonContiguousOrder { expected: 1, found: 2 });
    }

    #[test]
    fn duplicate_orders_are_rejected() {
        let err = WorkflowBuilder::new("dup")
            .step(WorkflowStep::new("a", 0, t("get_time")))
            .step(WorkflowStep::new("b", 0, t("get_time")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::NonContiguousOrder { .. }));
    }

    #[test]
    fn forward_dependency_is_rejected() {
        let err = WorkflowBuilder::new("fwd")
            .step(WorkflowStep::new("a", 0, t("get_time")).depends_on(["b"]))
            .step(WorkflowStep::new("b", 1, t("get_time")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::ForwardDependency { .. }));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err = WorkflowBuilder::new("self")
            .step(WorkflowStep::new("a", 0, t("get_time")).depends_on(["a"]))
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::SelfDependency("a".into()));
    }

    #[test]
    fn steps_are_sorted_by_order() {
        let wf = WorkflowBuilder::new("shuffled")
            .step(WorkflowStep::new("second", 1, t("status")))
            .step(WorkflowStep::new("first", 0, t("get_time")))
            .build()
            .unwrap();
        assert_eq!(wf.steps()[0].id.as_str(), "first");
    }

    #[test]
    fn revise_bumps_version() {
        let mut wf = Workflow::sequential("s", [t("get_time")]).unwrap();
        wf.revise(vec![WorkflowStep::new("x", 0, t("status"))]).unwrap();
        assert_eq!(wf.version(), 2);
        assert!(wf.revise(vec![WorkflowStep::new("x", 1, t("status"))]).is_err());
        assert_eq!(wf.steps()[0].id.as_str(), "x");
    }
}
