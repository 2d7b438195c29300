use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StorageConfig;
use crate::errors::MenderError;

static FRONT_MATTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^---[ \t]*\r?\n(.*?)\r?\n---[ \t]*\r?\n(.*)$").unwrap()
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputExtraction {
    pub mode: String,
    pub output_name: String,
}

impl Default for OutputExtraction {
    fn default() -> Self {
        Self {
            mode: "full".to_string(),
            output_name: "output".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FrontMatter {
    id: String,
    name: String,
    description: Option<String>,
    output_extraction: Option<OutputExtraction>,
}

/// Markdown prompt with YAML front matter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub output_extraction: OutputExtraction,
    pub template: String,
    #[serde(skip)]
    pub path: PathBuf,
}

impl PromptTemplate {
    /// Parse `---\n<yaml>\n---\n<body>`. Returns `None` without front matter.
    pub fn parse(content: &str, path: &Path) -> Option<Self> {
        let caps = FRONT_MATTER.captures(content)?;
        let front: FrontMatter = match serde_yaml::from_str(caps.get(1)?.as_str()) {
            Ok(front) => front,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Invalid prompt front matter");
                return None;
            }
        };
        Some(Self {
            id: front.id,
            name: front.name,
            description: front.description,
            output_extraction: front.output_extraction.unwrap_or_default(),
            template: caps.get(2)?.as_str().trim().to_string(),
            path: path.to_path_buf(),
        })
    }

    fn matches(&self, template_id: &str) -> bool {
        self.id == template_id
            || self.path.file_stem().and_then(|s| s.to_str()) == Some(template_id)
    }
}

/// Resolves prompt templates: the run's project first, then the other known
/// projects, then the global store.
#[derive(Debug, Clone)]
pub struct PromptTemplateStore {
    storage: StorageConfig,
}

impl PromptTemplateStore {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    pub fn search_dirs(&self, project_path: Option<&str>, known_projects: &[String]) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(project) = project_path.filter(|p| !p.is_empty()) {
            dirs.push(self.storage.project_dir(project).join("prompts"));
        }
        for other in known_projects {
            if other.is_empty() || Some(other.as_str()) == project_path {
                continue;
            }
            dirs.push(self.storage.project_dir(other).join("prompts"));
        }
        dirs.push(self.storage.global_prompts_dir());
        dirs
    }

    pub async fn load(
        &self,
        template_id: &str,
        project_path: Option<&str>,
        known_projects: &[String],
    ) -> Result<PromptTemplate, MenderError> {
        for dir in self.search_dirs(project_path, known_projects) {
            for path in markdown_files(&dir) {
                let content = match tokio::fs::read_to_string(&path).await {
                    Ok(content) => content,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Skipping unreadable prompt");
                        continue;
                    }
                };
                if let Some(template) = PromptTemplate::parse(&content, &path) {
                    if template.matches(template_id) {
                        debug!(template_id = %template_id, path = %path.display(), "Prompt template resolved");
                        return Ok(template);
                    }
                }
            }
        }
        Err(MenderError::Template(format!("Prompt template not found: {}", template_id)))
    }
}

fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    let pattern = dir.join("**").join("*.md");
    let mut files: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}
