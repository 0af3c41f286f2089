/// File-backed persistence for serialized workflows
///
/// Workflows are stored as one JSON document per workflow (`<root>/<id>.json`),
/// the same form the workflow compiler emits.

use crate::workflow::types::SerializedWorkflow;
use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// Directory-based workflow storage
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// Directory holding `<id>.json` documents
    root: PathBuf,
}

impl WorkflowStorage {
    /// Create new storage rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Parse a single workflow document from any path
    pub async fn read_file(path: impl AsRef<Path>) -> Result<SerializedWorkflow> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
        let workflow: SerializedWorkflow = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid workflow JSON in {}", path.display()))?;
        Ok(workflow)
    }

    /// Store a workflow, replacing any previous version
    pub async fn save_workflow(&self, workflow: &SerializedWorkflow) -> Result<()> {
        if workflow.id.is_empty() {
            return Err(anyhow::anyhow!("Cannot store a workflow without an id"));
        }
        let path = self.path_for(&workflow.id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create workflow directory {}", self.root.display()))?;

        let definition_json = serde_json::to_string_pretty(workflow)?;
        tokio::fs::write(path, definition_json).await?;

        tracing::debug!("💾 Stored workflow '{}'", workflow.id);
        Ok(())
    }

    /// Retrieve a workflow by ID
    pub async fn load_workflow(&self, id: &str) -> Result<Option<SerializedWorkflow>> {
        let path = self.path_for(id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_file(&path).await.map(Some)
    }

    /// Load every `*.json` workflow in the storage directory
    ///
    /// Keyed by workflow id; documents without an id are keyed by file stem.
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, SerializedWorkflow>> {
        let mut workflows = HashMap::new();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(workflows);
        }

        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let mut workflow = Self::read_file(&path).await?;
            if workflow.id.is_empty() {
                workflow.id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
            }
            workflows.insert(workflow.id.clone(), workflow);
        }

        tracing::info!("📥 Loaded {} workflows from {}", workflows.len(), self.root.display());
        Ok(workflows)
    }

    /// Delete a workflow by ID
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        Ok(true)
    }

    /// Document path for `id`; ids must stay a single file name inside `root`
    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id == "." || id == ".." || id.contains(|c: char| c == '/' || c == '\\') {
            return Err(anyhow::anyhow!("Invalid workflow id: {:?}", id));
        }
        Ok(self.root.join(format!("{}.json", id)))
    }
}
