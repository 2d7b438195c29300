use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration. Every section is optional in the YAML
/// file; missing values fall back to the defaults below.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MenderConfig {
    pub registry: RegistryConfig,
    pub agents: AgentsConfig,
    pub heartbeat: HeartbeatConfig,
    pub activity: ActivityConfig,
    pub storage: StorageConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: Option<PathBuf>,
    pub poll_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub connect_timeout_secs: u64,
    pub recv_timeout_secs: u64,
    pub prompt_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub listen_poll_millis: u64,
    pub session_reset_delay_millis: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            recv_timeout_secs: 5,
            prompt_timeout_secs: 120,
            command_timeout_secs: 10,
            listen_poll_millis: 1000,
            session_reset_delay_millis: 500,
        }
    }
}

impl AgentsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn listen_poll(&self) -> Duration {
        Duration::from_millis(self.listen_poll_millis)
    }

    pub fn session_reset_delay(&self) -> Duration {
        Duration::from_millis(self.session_reset_delay_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub stale_threshold_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            ping_timeout_secs: 5,
            stale_threshold_secs: 30,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub max_events: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self { max_events: 100 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Global store holding `workflows/`, `prompts/`, `runs/` and the registry file.
    pub home: Option<PathBuf>,
    /// Name of the per-project directory that shadows the global store.
    pub project_dir_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            home: None,
            project_dir_name: ".citi-agent".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn home_dir(&self) -> PathBuf {
        match &self.home {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".citi-agent"),
        }
    }

    pub fn global_workflows_dir(&self) -> PathBuf {
        self.home_dir().join("workflows")
    }

    pub fn global_prompts_dir(&self) -> PathBuf {
        self.home_dir().join("prompts")
    }

    pub fn global_runs_dir(&self) -> PathBuf {
        self.home_dir().join("runs")
    }

    pub fn project_dir(&self, project_path: &str) -> PathBuf {
        PathBuf::from(project_path).join(&self.project_dir_name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl MenderConfig {
    pub fn registry_path(&self) -> PathBuf {
        match &self.registry.path {
            Some(path) => path.clone(),
            None => self.storage.home_dir().join("registry.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_constants() {
        let config = MenderConfig::default();
        assert_eq!(config.agents.prompt_timeout_secs, 120);
        assert_eq!(config.heartbeat.interval_secs, 10);
        assert_eq!(config.heartbeat.stale_threshold_secs, 30);
        assert_eq!(config.registry.poll_interval_secs, 10);
        assert_eq!(config.activity.max_events, 100);
    }

    #[test]
    fn test_registry_path_defaults_under_home() {
        let config = MenderConfig {
            storage: StorageConfig {
                home: Some(PathBuf::from("/tmp/mender-home")),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.registry_path(), PathBuf::from("/tmp/mender-home/registry.json"));
        assert_eq!(config.storage.global_runs_dir(), PathBuf::from("/tmp/mender-home/runs"));
    }

    #[test]
    fn test_project_dir_uses_configured_name() {
        let storage = StorageConfig::default();
        assert_eq!(
            storage.project_dir("/work/app"),
            PathBuf::from("/work/app/.citi-agent")
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: MenderConfig = serde_yaml::from_str("heartbeat:\n  interval_secs: 3\n").unwrap();
        assert_eq!(config.heartbeat.interval_secs, 3);
        assert_eq!(config.heartbeat.stale_threshold_secs, 30);
        assert_eq!(config.agents.connect_timeout_secs, 5);
    }
}
