use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::connection::{AgentConnection, Health};
use super::protocol::PromptResponse;
use crate::config::AgentsConfig;
use crate::errors::MenderError;
use crate::events::Broadcaster;
use crate::registry::RegistryEntry;

/// Registry entry merged with runtime health, for presentation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub instance_id: String,
    pub port: Option<u16>,
    pub address: Option<String>,
    pub project_path: String,
    pub project_name: String,
    pub capabilities: Vec<String>,
    pub role: Option<String>,
    pub agent_name: Option<String>,
    pub connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub health: Health,
    pub busy: bool,
}

/// Reply from [`AgentPool::send_prompt_with_handoff`].
#[derive(Debug, Clone, Serialize)]
pub struct HandoffReply {
    /// Agent that actually served the prompt.
    pub instance_id: String,
    /// Requested agent, when it was busy and the prompt went elsewhere.
    pub handed_off_from: Option<String>,
    pub response: PromptResponse,
}

/// Owns every [`AgentConnection`]. Iteration follows insertion order, which
/// follows registry snapshot order, so selection is deterministic.
pub struct AgentPool {
    connections: RwLock<Vec<Arc<AgentConnection>>>,
    broadcaster: Arc<Broadcaster>,
    settings: AgentsConfig,
    ping_timeout: Duration,
}

impl AgentPool {
    pub fn new(broadcaster: Arc<Broadcaster>, settings: AgentsConfig, ping_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            broadcaster,
            settings,
            ping_timeout,
        }
    }

    /// Create a connection for `instance_id` (replacing any previous one in
    /// place), connect it and start its listener. Returns whether it connected.
    pub async fn connect_agent(&self, instance_id: &str, entry: RegistryEntry) -> bool {
        let conn = Arc::new(AgentConnection::new(
            instance_id,
            entry,
            self.settings.clone(),
            self.ping_timeout,
            self.broadcaster.clone(),
        ));

        let previous = {
            let mut connections = self.connections.write().await;
            match connections.iter().position(|c| c.instance_id() == instance_id) {
                Some(idx) => Some(std::mem::replace(&mut connections[idx], conn.clone())),
                None => {
                    connections.push(conn.clone());
                    None
                }
            }
        };
        if let Some(old) = previous {
            old.disconnect().await;
        }

        if conn.connect().await {
            tokio::spawn(conn.clone().listen());
            true
        } else {
            false
        }
    }

    pub async fn disconnect_agent(&self, instance_id: &str) {
        let removed = {
            let mut connections = self.connections.write().await;
            connections
                .iter()
                .position(|c| c.instance_id() == instance_id)
                .map(|idx| connections.remove(idx))
        };
        match removed {
            Some(conn) => conn.disconnect().await,
            None => debug!(instance_id = %instance_id, "Disconnect for unknown agent"),
        }
    }

    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = self.connections.write().await.drain(..).collect();
        for conn in drained {
            conn.disconnect().await;
        }
    }

    pub async fn connections(&self) -> Vec<Arc<AgentConnection>> {
        self.connections.read().await.clone()
    }

    pub async fn get_connection(&self, instance_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .await
            .iter()
            .find(|c| c.instance_id() == instance_id)
            .cloned()
    }

    /// First healthy connected agent, else the first connected one.
    pub async fn get_connected_agent(&self) -> Option<Arc<AgentConnection>> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .find(|c| c.is_connected() && c.health() == Health::Healthy)
            .or_else(|| connections.iter().find(|c| c.is_connected()))
            .cloned()
    }

    /// First connected agent whose project path matches exactly.
    pub async fn get_agent_for_project(&self, project_path: &str) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .await
            .iter()
            .find(|c| c.is_connected() && c.project_path() == project_path)
            .cloned()
    }

    /// First connected, not busy agent on the project.
    pub async fn get_available_agent_for_project(
        &self,
        project_path: &str,
    ) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .await
            .iter()
            .find(|c| {
                c.is_connected()
                    && c.health() != Health::Disconnected
                    && !c.is_busy()
                    && c.project_path() == project_path
            })
            .cloned()
    }

    /// Send to `instance_id`, or to a free agent on the same project when the
    /// target is busy.
    pub async fn send_prompt_with_handoff(
        &self,
        instance_id: &str,
        prompt: &str,
    ) -> Result<HandoffReply, MenderError> {
        let target = self
            .get_connection(instance_id)
            .await
            .ok_or_else(|| MenderError::NotConnected(instance_id.to_string()))?;

        let (conn, handed_off_from) = if target.is_busy() {
            match self.get_available_agent_for_project(&target.project_path()).await {
                Some(other) if other.instance_id() != instance_id => {
                    info!(
                        from = %instance_id,
                        to = %other.instance_id(),
                        "Agent busy, handing off prompt"
                    );
                    (other, Some(instance_id.to_string()))
                }
                _ => (target, None),
            }
        } else {
            (target, None)
        };

        let response = conn.send_prompt(prompt).await?;
        Ok(HandoffReply {
            instance_id: conn.instance_id().to_string(),
            handed_off_from,
            response,
        })
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| c.instance_id().to_string())
            .collect()
    }

    pub async fn get_agents_summary(&self) -> Vec<AgentSummary> {
        self.connections
            .read()
            .await
            .iter()
            .map(|c| c.summary())
            .collect()
    }
}
