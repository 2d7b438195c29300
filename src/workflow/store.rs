use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::graph::WorkflowGraph;
use crate::config::StorageConfig;
use crate::errors::MenderError;

/// Finds workflow graphs on disk. Project-local storage is searched before
/// the global directory.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    storage: StorageConfig,
}

impl WorkflowStore {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    pub fn search_roots(&self, project_path: Option<&str>) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        if let Some(project) = project_path.filter(|p| !p.is_empty()) {
            roots.push(self.storage.project_dir(project).join("workflows"));
        }
        roots.push(self.storage.global_workflows_dir());
        roots
    }

    /// Load by id: a file whose stem equals `id` in any root wins, otherwise
    /// the first graph whose embedded `name` equals `id`.
    pub async fn load(
        &self,
        workflow_id: &str,
        project_path: Option<&str>,
    ) -> Result<WorkflowGraph, MenderError> {
        let files: Vec<PathBuf> = self
            .search_roots(project_path)
            .iter()
            .flat_map(|root| json_files(root))
            .collect();

        if let Some(path) = files
            .iter()
            .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(workflow_id))
        {
            match read_graph(path).await {
                Ok(graph) => {
                    debug!(workflow_id = %workflow_id, path = %path.display(), "Workflow matched by file name");
                    return Ok(graph);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Workflow file unreadable"),
            }
        }

        for path in &files {
            match read_graph(path).await {
                Ok(graph) if graph.name.as_deref() == Some(workflow_id) => {
                    debug!(workflow_id = %workflow_id, path = %path.display(), "Workflow matched by name");
                    return Ok(graph);
                }
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable workflow"),
            }
        }

        Err(MenderError::WorkflowNotFound(workflow_id.to_string()))
    }
}

pub async fn read_graph(path: &Path) -> Result<WorkflowGraph, MenderError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// `*.json` under `root`, recursively, in sorted order.
fn json_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let pattern = root.join("**").join("*.json");
    let pattern_str = pattern.to_string_lossy();
    match glob::glob(&pattern_str) {
        Ok(paths) => {
            let mut files: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
            files.sort();
            files
        }
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Invalid workflow search pattern");
            Vec::new()
        }
    }
}
