use super::{Workflow, WorkflowId};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Listing entry; reading it does not validate the whole workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One pretty-printed JSON file per workflow, named `<id>.json`.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    root: PathBuf,
}

impl WorkflowStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: WorkflowId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Writes through a temp file so a crash never leaves a torn workflow.
    pub async fn save(&self, workflow: &mut Workflow) -> Result<(), StoreError> {
        workflow.touch();
        let body = serde_json::to_vec_pretty(workflow)?;
        let path = self.path_for(workflow.id());
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(workflow = %workflow.id(), name = workflow.name(), version = workflow.version(), "saved workflow");
        Ok(())
    }

    /// Loads and re-validates a workflow.
    pub async fn load(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        let path = self.path_for(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let workflow: Workflow = serde_json::from_slice(&raw)?;
        tracing::debug!(workflow = %id, version = workflow.version(), "loaded workflow");
        Ok(workflow)
    }

    /// Summaries sorted by name. Unreadable files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let mut summaries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(StoreError::from)
                .and_then(|raw| serde_json::from_slice::<WorkflowSummary>(&raw).map_err(StoreError::from));
            match parsed {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable workflow"),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }

    pub async fn delete(&self, id: WorkflowId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => {
                tracing::info!(workflow = %id, "deleted workflow");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
