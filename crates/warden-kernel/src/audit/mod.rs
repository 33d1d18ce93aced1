//! Execution logging.
//!
//! Every dispatched command is wrapped with a before and after
//! [`StateSnapshot`] and turned into an append-only [`ExecutionRecord`]
//! carrying rollback instructions. Commands with no known inverse are marked
//! `irreversible` instead of getting an empty instruction list.
//!
//! A failed capture or write is an [`AuditError`]; the gateway treats it as
//! fatal, so a command is never considered dispatched without its record.

mod log;
mod rollback;

pub use log::{verify_chain, AuditEntry, AuditSink, JsonlAuditLog, MemoryAuditLog, GENESIS_HASH};
pub use rollback::{synthesize_rollback, Rollback, RollbackInstruction, READ_ONLY_INTENTS};

use crate::error::AuditError;
use crate::executor::{ActionOutcome, ResourceChange};
use crate::risk::PATH_ENTITY_KEYS;
use crate::types::{Command, CommandId, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Observed state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResourceState {
    Absent,
    Present { fingerprint: String },
    /// The probe cannot observe this resource
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub phase: SnapshotPhase,
    pub captured_at: DateTime<Utc>,
    pub command_id: CommandId,
    pub intent: String,
    pub resources: BTreeMap<String, ResourceState>,
    /// Changes reported by the executor; empty before execution
    pub changes: Vec<ResourceChange>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Immutable audit artifact for one dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub record_id: RecordId,
    pub command_id: CommandId,
    pub intent: String,
    pub entities: crate::types::Entities,
    pub created_at: DateTime<Utc>,
    pub before: StateSnapshot,
    pub after: StateSnapshot,
    pub success: bool,
    pub error: Option<String>,
    pub rollback: Rollback,
    pub execution_time_ms: u64,
}

/// Reads the current state of a resource.
#[async_trait::async_trait]
pub trait StateProbe: Send + Sync {
    async fn probe(&self, resource: &str) -> Result<ResourceState, AuditError>;
}

/// Probe that observes nothing; every resource is `Unknown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProbe;

#[async_trait::async_trait]
impl StateProbe for NullProbe {
    async fn probe(&self, _resource: &str) -> Result<ResourceState, AuditError> {
        Ok(ResourceState::Unknown)
    }
}

/// Probe backed by file metadata. The fingerprint covers kind, length and
/// modification time, not content.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

#[async_trait::async_trait]
impl StateProbe for FsProbe {
    async fn probe(&self, resource: &str) -> Result<ResourceState, AuditError> {
        match tokio::fs::metadata(Path::new(resource)).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                let mut hasher = Sha256::new();
                hasher.update([u8::from(meta.is_dir())]);
                hasher.update(meta.len().to_le_bytes());
                hasher.update(modified.to_le_bytes());
                Ok(ResourceState::Present {
                    fingerprint: hex::encode(hasher.finalize()),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ResourceState::Absent),
            Err(e) => Err(AuditError::CaptureFailed {
                resource: resource.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Wraps dispatched commands with state capture and appends their records.
#[derive(Clone)]
pub struct ExecutionLogger {
    probe: Arc<dyn StateProbe>,
    sink: Arc<dyn AuditSink>,
}

impl ExecutionLogger {
    pub fn new(probe: Arc<dyn StateProbe>, sink: Arc<dyn AuditSink>) -> Self {
        Self { probe, sink }
    }

    /// In-memory log with no state observation.
    pub fn in_memory() -> (Self, Arc<MemoryAuditLog>) {
        let log = Arc::new(MemoryAuditLog::new());
        (Self::new(Arc::new(NullProbe), log.clone()), log)
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub async fn capture_before(&self, command: &Command) -> Result<StateSnapshot, AuditError> {
        let resources = self.probe_all(target_resources(command)).await?;
        Ok(StateSnapshot {
            phase: SnapshotPhase::Before,
            captured_at: Utc::now(),
            command_id: command.id,
            intent: command.intent.clone(),
            resources,
            changes: Vec::new(),
            result: None,
            error: None,
        })
    }

    pub async fn capture_after(
        &self,
        command: &Command,
        outcome: &ActionOutcome,
    ) -> Result<StateSnapshot, AuditError> {
        let mut targets = target_resources(command);
        for change in &outcome.state_delta {
            for resource in change.resources() {
                if !targets.iter().any(|t| t == resource) {
                    targets.push(resource.to_string());
                }
            }
        }
        let resources = self.probe_all(targets).await?;
        Ok(StateSnapshot {
            phase: SnapshotPhase::After,
            captured_at: Utc::now(),
            command_id: command.id,
            intent: command.intent.clone(),
            resources,
            changes: outcome.state_delta.clone(),
            result: outcome.result.clone(),
            error: outcome.error.clone(),
        })
    }

    /// Builds the record, synthesizes its rollback and appends it durably.
    pub async fn log_execution(
        &self,
        command: &Command,
        before: StateSnapshot,
        after: StateSnapshot,
        success: bool,
        execution_time_ms: u64,
    ) -> Result<ExecutionRecord, AuditError> {
        let rollback = synthesize_rollback(
            &command.intent,
            &command.entities,
            &before.resources,
            &after.resources,
            &after.changes,
            success,
        );
        let record = ExecutionRecord {
            record_id: RecordId::new(),
            command_id: command.id,
            intent: command.intent.clone(),
            entities: command.entities.clone(),
            created_at: Utc::now(),
            error: after.error.clone(),
            before,
            after,
            success,
            rollback,
            execution_time_ms,
        };
        let entry = self.sink.append(&record).await?;
        tracing::debug!(
            record_id = %record.record_id,
            sequence = entry.sequence,
            irreversible = record.rollback.irreversible,
            "execution record appended"
        );
        Ok(record)
    }

    async fn probe_all(
        &self,
        resources: Vec<String>,
    ) -> Result<BTreeMap<String, ResourceState>, AuditError> {
        let mut states = BTreeMap::new();
        for resource in resources {
            let state = self.probe.probe(&resource).await?;
            states.insert(resource, state);
        }
        Ok(states)
    }
}

impl std::fmt::Debug for ExecutionLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLogger").finish_non_exhaustive()
    }
}

fn target_resources(command: &Command) -> Vec<String> {
    command
        .entities
        .iter()
        .filter(|(k, _)| PATH_ENTITY_KEYS.contains(&k.as_str()))
        .filter_map(|(_, v)| v.as_str())
        .map(String::from)
        .collect()
}
