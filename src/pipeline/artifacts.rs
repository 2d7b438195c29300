use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::StorageConfig;
use crate::errors::MenderError;
use crate::utils::fs::{atomic_write, sanitize_label};
use crate::workflow::WorkflowNode;

/// Contents of one step artifact file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StepArtifact<'a> {
    step: usize,
    node_id: &'a str,
    node_label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_name: Option<&'a str>,
    timestamp: String,
    response: &'a Value,
}

/// Per-failure directory of numbered step outputs.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
}

impl RunDirectory {
    /// `<project>/.citi-agent/runs/<id>` with a project, else `<home>/runs/<id>`.
    pub fn for_failure(storage: &StorageConfig, project_path: Option<&str>, failure_id: &str) -> Self {
        let base = match project_path.filter(|p| !p.is_empty()) {
            Some(project) => storage.project_dir(project).join("runs"),
            None => storage.global_runs_dir(),
        };
        Self {
            path: base.join(failure_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recreate the directory empty.
    pub async fn prepare(&self) -> Result<(), MenderError> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.path).await?;
        }
        tokio::fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    pub fn file_name(step: usize, label: &str) -> String {
        format!("{:02}-{}.json", step, sanitize_label(label))
    }

    pub async fn write_step(
        &self,
        step: usize,
        node: &WorkflowNode,
        output_name: Option<&str>,
        result: &Value,
    ) -> Result<PathBuf, MenderError> {
        let artifact = StepArtifact {
            step,
            node_id: &node.id,
            node_label: &node.label,
            output_name,
            timestamp: Utc::now().to_rfc3339(),
            response: result,
        };
        let path = self.path.join(Self::file_name(step, &node.label));
        let content = serde_json::to_string_pretty(&artifact)?;
        atomic_write(&path, &content).await?;
        debug!(path = %path.display(), "Step artifact written");
        Ok(path)
    }

    /// Artifact file names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.path).await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Human-readable listing appended to prompts. Empty when nothing has
    /// been written yet.
    pub async fn listing(&self) -> String {
        let names = self.list().await;
        if names.is_empty() {
            return String::new();
        }
        let mut out = format!(
            "\n\n## Previous step outputs\nEarlier results of this run are saved in {}:\n",
            self.path.display()
        );
        for name in names {
            out.push_str(&format!("- {}\n", name));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NodeKind;
    use serde_json::json;

    fn storage(home: &Path) -> StorageConfig {
        StorageConfig {
            home: Some(home.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_location() {
        let storage = storage(Path::new("/h"));
        let global = RunDirectory::for_failure(&storage, None, "fail-1");
        assert_eq!(global.path(), Path::new("/h/runs/fail-1"));

        let local = RunDirectory::for_failure(&storage, Some("/w/shop"), "fail-1");
        assert_eq!(local.path(), Path::new("/w/shop/.citi-agent/runs/fail-1"));
    }

    #[tokio::test]
    async fn test_write_and_list() {
        let home = tempfile::tempdir().unwrap();
        let run = RunDirectory::for_failure(&storage(home.path()), None, "fail-1");
        run.prepare().await.unwrap();
        assert_eq!(run.listing().await, "");

        let node = WorkflowNode::new("n1", NodeKind::Start).with_label("Analyze Failure");
        let path = run
            .write_step(1, &node, Some("analysis"), &json!({"response": "ok"}))
            .await
            .unwrap();
        assert!(path.ends_with("01-analyze-failure.json"));

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["step"], 1);
        assert_eq!(written["nodeId"], "n1");
        assert_eq!(written["nodeLabel"], "Analyze Failure");
        assert_eq!(written["outputName"], "analysis");
        assert_eq!(written["response"]["response"], "ok");

        assert_eq!(run.list().await, vec!["01-analyze-failure.json"]);
        assert!(run.listing().await.contains("- 01-analyze-failure.json"));
    }

    #[tokio::test]
    async fn test_prepare_clears_previous_run() {
        let home = tempfile::tempdir().unwrap();
        let run = RunDirectory::for_failure(&storage(home.path()), None, "fail-2");
        run.prepare().await.unwrap();
        std::fs::write(run.path().join("01-old.json"), "{}").unwrap();

        run.prepare().await.unwrap();
        assert!(run.list().await.is_empty());
    }
}
