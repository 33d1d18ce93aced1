//! Testing utilities for the Warden workspace
//!
//! Scripted collaborators, failing audit seams and workflow fixtures.

#![allow(missing_docs)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use warden_kernel::audit::{
    AuditEntry, AuditSink, ExecutionLogger, ExecutionRecord, MemoryAuditLog, NullProbe, ResourceState, StateProbe,
};
use warden_kernel::config::GovernanceConfig;
use warden_kernel::context::GovernanceState;
use warden_kernel::executor::{ActionExecutor, ActionOutcome, ActionRequest};
use warden_kernel::gateway::ExecutionGateway;
use warden_kernel::orchestrator::{Orchestrator, Planner};
use warden_kernel::workflow::{CommandTemplate, Workflow, WorkflowBuilder};
use warden_kernel::{AuditError, Entities, GovernanceError, PermissionMode};

/// Executor that records every request and answers from a script.
///
/// Intents without a scripted outcome succeed with `{"ok": true}`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<(String, Entities)>>,
    outcomes: Mutex<HashMap<String, ActionOutcome>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(self, intent: &str, outcome: ActionOutcome) -> Self {
        self.outcomes.lock().insert(intent.to_string(), outcome);
        self
    }

    pub fn failing(self, intent: &str, error: &str) -> Self {
        self.with_outcome(intent, ActionOutcome::failure(error))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(intent, _)| intent.clone()).collect()
    }

    pub fn call_entities(&self) -> Vec<Entities> {
        self.calls.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait::async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, request: ActionRequest) -> ActionOutcome {
        self.calls
            .lock()
            .push((request.intent().to_string(), request.entities().clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcomes
            .lock()
            .get(request.intent())
            .cloned()
            .unwrap_or_else(|| ActionOutcome::success(serde_json::json!({ "ok": true })))
    }
}

/// Sink whose writes always fail.
#[derive(Debug, Default)]
pub struct FailingSink;

#[async_trait::async_trait]
impl AuditSink for FailingSink {
    async fn append(&self, _record: &ExecutionRecord) -> Result<AuditEntry, AuditError> {
        Err(AuditError::WriteFailed("disk full".into()))
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(Vec::new())
    }
}

/// Sink that keeps the first `capacity` records, then fails every write.
#[derive(Debug, Default)]
pub struct CappedSink {
    inner: MemoryAuditLog,
    capacity: usize,
}

impl CappedSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: MemoryAuditLog::new(),
            capacity,
        }
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.inner.records()
    }
}

#[async_trait::async_trait]
impl AuditSink for CappedSink {
    async fn append(&self, record: &ExecutionRecord) -> Result<AuditEntry, AuditError> {
        if self.inner.len() >= self.capacity {
            return Err(AuditError::WriteFailed("disk full".into()));
        }
        self.inner.append(record).await
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner.entries().await
    }
}

/// Probe that cannot observe anything.
#[derive(Debug, Default)]
pub struct FailingProbe;

#[async_trait::async_trait]
impl StateProbe for FailingProbe {
    async fn probe(&self, resource: &str) -> Result<ResourceState, AuditError> {
        Err(AuditError::CaptureFailed {
            resource: resource.to_string(),
            reason: "permission denied".into(),
        })
    }
}

/// Planner that always returns the same templates.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlanner {
    pub templates: Vec<CommandTemplate>,
}

impl ScriptedPlanner {
    pub fn new(templates: Vec<CommandTemplate>) -> Self {
        Self { templates }
    }
}

#[async_trait::async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _goal: &str) -> Result<Vec<CommandTemplate>, GovernanceError> {
        Ok(self.templates.clone())
    }
}

pub fn state_with_mode(mode: PermissionMode) -> Arc<GovernanceState> {
    state_with_config(GovernanceConfig::new().with_permission_mode(mode))
}

pub fn state_with_config(config: GovernanceConfig) -> Arc<GovernanceState> {
    Arc::new(GovernanceState::new(config))
}

/// Gateway over a scripted executor and an in-memory audit log.
pub fn gateway_with(
    state: Arc<GovernanceState>,
    executor: ScriptedExecutor,
) -> (Arc<ExecutionGateway>, Arc<MemoryAuditLog>, Arc<ScriptedExecutor>) {
    let executor = Arc::new(executor);
    let audit = Arc::new(MemoryAuditLog::new());
    let logger = ExecutionLogger::new(Arc::new(NullProbe), audit.clone());
    let gateway = Arc::new(ExecutionGateway::new(executor.clone(), logger, state));
    (gateway, audit, executor)
}

pub fn orchestrator_with(
    state: Arc<GovernanceState>,
    executor: ScriptedExecutor,
) -> (Orchestrator, Arc<MemoryAuditLog>, Arc<ScriptedExecutor>) {
    let (gateway, audit, executor) = gateway_with(state, executor);
    (Orchestrator::new(gateway), audit, executor)
}

/// create_folder("backup"), then move a.txt and b.txt into it.
pub fn backup_workflow() -> Workflow {
    WorkflowBuilder::new("backup")
        .description("move loose files into a backup folder")
        .then("mkdir", CommandTemplate::new("create_folder").with_param("folder", "backup"))
        .then(
            "move-a",
            CommandTemplate::new("move_file")
                .with_param("source", "a.txt")
                .with_param("destination", "backup/"),
        )
        .then(
            "move-b",
            CommandTemplate::new("move_file")
                .with_param("source", "b.txt")
                .with_param("destination", "backup/"),
        )
        .build()
        .expect("backup workflow is valid")
}

/// Five read-only steps where the third repeats the first.
pub fn repeating_workflow() -> Workflow {
    WorkflowBuilder::new("repeating")
        .push("s1", CommandTemplate::new("get_time"))
        .push("s2", CommandTemplate::new("status"))
        .push("s3", CommandTemplate::new("get_time"))
        .push("s4", CommandTemplate::new("help"))
        .push("s5", CommandTemplate::new("list"))
        .build()
        .expect("repeating workflow is valid")
}
