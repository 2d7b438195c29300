use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// One agent as described by the registry file. Keys are camelCase on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, alias = "displayName", skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl RegistryEntry {
    /// WebSocket URL for this agent: the explicit address if present,
    /// otherwise `ws://localhost:{port}`.
    pub fn url(&self) -> Option<String> {
        match (&self.address, self.port) {
            (Some(addr), _) if addr.starts_with("ws://") || addr.starts_with("wss://") => {
                Some(addr.clone())
            }
            (Some(addr), _) if !addr.is_empty() => Some(format!("ws://{}", addr)),
            (_, Some(port)) => Some(format!("ws://localhost:{}", port)),
            _ => None,
        }
    }

    pub fn project_name(&self) -> String {
        project_name(&self.project_path)
    }
}

/// Last path segment of a project path, or `"Unknown"`.
pub fn project_name(project_path: &str) -> String {
    project_path
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("Unknown")
        .to_string()
}

/// Registry contents in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    entries: Vec<(String, RegistryEntry)>,
}

impl RegistrySnapshot {
    pub fn new(entries: Vec<(String, RegistryEntry)>) -> Self {
        Self { entries }
    }

    /// Parse a registry document. Entries that fail to decode are skipped.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let map: Map<String, Value> = serde_json::from_str(content)?;
        let mut entries = Vec::with_capacity(map.len());
        for (instance_id, raw) in map {
            match serde_json::from_value::<RegistryEntry>(raw) {
                Ok(entry) => entries.push((instance_id, entry)),
                Err(e) => warn!(instance_id = %instance_id, error = %e, "Skipping malformed registry entry"),
            }
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, RegistryEntry)> {
        self.entries.iter()
    }

    pub fn get(&self, instance_id: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|(id, _)| id == instance_id)
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.get(instance_id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Distinct project paths, in entry order.
    pub fn project_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for (_, entry) in &self.entries {
            if !entry.project_path.is_empty() && !paths.contains(&entry.project_path) {
                paths.push(entry.project_path.clone());
            }
        }
        paths
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Membership list of known agents.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Current contents. Read errors degrade to an empty snapshot.
    async fn snapshot(&self) -> RegistrySnapshot;

    /// File to watch for change notifications, if the source is file-backed.
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}

/// Registry backed by a JSON file mapping instance id to entry.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistrySource for FileRegistry {
    async fn snapshot(&self) -> RegistrySnapshot {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Registry file not found");
                return RegistrySnapshot::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read registry");
                return RegistrySnapshot::default();
            }
        };

        if content.trim().is_empty() {
            return RegistrySnapshot::default();
        }

        match RegistrySnapshot::from_json(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Malformed registry file");
                RegistrySnapshot::default()
            }
        }
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
