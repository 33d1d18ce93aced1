//! Downstream action boundary.
//!
//! The executor is the automation collaborator that actually performs a
//! step. It only ever sees an [`ActionRequest`], which can only be built by
//! the gateway from an approved command.

use crate::types::{CommandId, Entities};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One step handed to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    command_id: CommandId,
    intent: String,
    entities: Entities,
}

impl ActionRequest {
    pub(crate) fn new(command_id: CommandId, intent: String, entities: Entities) -> Self {
        Self {
            command_id,
            intent,
            entities,
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }
}

/// Observable effect of a step on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ResourceChange {
    Created { resource: String },
    Removed { resource: String },
    Modified { resource: String },
    Moved { from: String, to: String },
}

impl ResourceChange {
    /// Resources whose state the change touches.
    pub fn resources(&self) -> Vec<&str> {
        match self {
            ResourceChange::Created { resource }
            | ResourceChange::Removed { resource }
            | ResourceChange::Modified { resource } => vec![resource.as_str()],
            ResourceChange::Moved { from, to } => vec![from.as_str(), to.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub state_delta: Vec<ResourceChange>,
}

impl ActionOutcome {
    pub fn success(result: impl Into<Value>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
            state_delta: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            state_delta: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_change(mut self, change: ResourceChange) -> Self {
        self.state_delta.push(change);
        self
    }
}

/// Downstream automation collaborator.
///
/// Failures are reported in the outcome rather than as an error so the
/// gateway can record them like any other result.
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: ActionRequest) -> ActionOutcome;
}

pub type Handler = Arc<dyn Fn(&Entities) -> Result<Value, String> + Send + Sync>;

/// Executor backed by a table of synchronous handlers.
///
/// Ships with read-only built-ins (`get_time`, `status`, `help`). Intents
/// without a handler fail.
#[derive(Clone)]
pub struct HandlerExecutor {
    handlers: BTreeMap<String, Handler>,
}

impl HandlerExecutor {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut executor = Self::new();
        executor.register("get_time", |_| Ok(json!(Utc::now().to_rfc3339())));
        executor.register("status", |_| {
            Ok(json!({
                "service": "warden",
                "version": crate::VERSION,
                "state": "ready",
            }))
        });
        executor.register("help", |_| {
            Ok(json!(
                "ask for the time, the status, or a file operation; risky actions need confirmation"
            ))
        });
        executor
    }

    pub fn register<F>(&mut self, intent: impl Into<String>, handler: F)
    where
        F: Fn(&Entities) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(intent.into(), Arc::new(handler));
    }

    pub fn intents(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Default for HandlerExecutor {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for HandlerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerExecutor")
            .field("intents", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait::async_trait]
impl ActionExecutor for HandlerExecutor {
    async fn execute(&self, request: ActionRequest) -> ActionOutcome {
        match self.handlers.get(request.intent()) {
            Some(handler) => match handler(request.entities()) {
                Ok(value) => ActionOutcome::success(value),
                Err(error) => ActionOutcome::failure(error),
            },
            None => ActionOutcome::failure(format!("no handler for intent '{}'", request.intent())),
        }
    }
}
