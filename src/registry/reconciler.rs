use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event as FsEvent, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::{project_name, RegistryEntry, RegistrySnapshot, RegistrySource};
use crate::agents::AgentPool;
use crate::errors::MenderError;
use crate::events::{Broadcaster, Event};

/// What one reconcile cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub reconnected: Vec<String>,
}

/// Keeps the agent pool in step with the registry.
pub struct Reconciler {
    source: Arc<dyn RegistrySource>,
    pool: Arc<AgentPool>,
    broadcaster: Arc<Broadcaster>,
    poll_interval: Duration,
    known: Mutex<RegistrySnapshot>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn RegistrySource>,
        pool: Arc<AgentPool>,
        broadcaster: Arc<Broadcaster>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            pool,
            broadcaster,
            poll_interval,
            known: Mutex::new(RegistrySnapshot::default()),
        }
    }

    /// Diff the current snapshot against the last one and drive the pool.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut known = self.known.lock().await;
        let current = self.source.snapshot().await;
        let mut report = ReconcileReport::default();

        for (instance_id, entry) in current.iter() {
            if known.contains(instance_id) {
                continue;
            }
            let connected = self.pool.connect_agent(instance_id, entry.clone()).await;
            info!(instance_id = %instance_id, connected, "Agent registered");
            report.added.push(instance_id.clone());
        }

        for (instance_id, _) in known.iter() {
            if current.contains(instance_id) {
                continue;
            }
            self.pool.disconnect_agent(instance_id).await;
            self.broadcaster.broadcast(Event::AgentRemoved {
                instance_id: instance_id.clone(),
            });
            info!(instance_id = %instance_id, "Agent deregistered");
            report.removed.push(instance_id.clone());
        }

        for (instance_id, entry) in current.iter() {
            let Some(old) = known.get(instance_id) else {
                continue;
            };
            let Some(conn) = self.pool.get_connection(instance_id).await else {
                continue;
            };
            conn.set_entry(entry.clone());

            let changes = entry_changes(old, entry);
            if !changes.is_empty() {
                debug!(instance_id = %instance_id, fields = changes.len(), "Registry entry changed");
                self.broadcaster.broadcast(Event::AgentDelta {
                    instance_id: instance_id.clone(),
                    changes,
                });
                report.updated.push(instance_id.clone());
            }

            if !conn.is_connected() && self.pool.connect_agent(instance_id, entry.clone()).await {
                info!(instance_id = %instance_id, "Agent reconnected");
                report.reconnected.push(instance_id.clone());
            }
        }

        *known = current;
        report
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.reconcile_once().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Held for the life of the loop; dropping it stops the watch.
        let _watcher = match self.source.watch_path() {
            Some(path) => match watch_registry(path, tx) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, "Registry watcher unavailable, polling only");
                    None
                }
            },
            None => None,
        };

        info!(poll_secs = self.poll_interval.as_secs(), "Registry reconciler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = rx.recv() => {
                    while rx.try_recv().is_ok() {}
                    debug!("Registry change notification");
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let report = self.reconcile_once().await;
            if report != ReconcileReport::default() {
                debug!(?report, "Registry reconciled");
            }
        }
        info!("Registry reconciler stopped");
    }
}

/// Compare the mutable fields of two entries. Keys follow the agent summary.
fn entry_changes(old: &RegistryEntry, new: &RegistryEntry) -> Map<String, Value> {
    let mut changes = Map::new();
    if old.role != new.role {
        changes.insert("role".into(), json!(new.role));
    }
    if old.project_path != new.project_path {
        changes.insert("project_path".into(), json!(new.project_path));
        changes.insert("project_name".into(), json!(project_name(&new.project_path)));
    }
    if old.capabilities != new.capabilities {
        changes.insert("capabilities".into(), json!(new.capabilities));
    }
    if old.agent_name != new.agent_name {
        changes.insert("agent_name".into(), json!(new.agent_name));
    }
    changes
}

/// Watch the registry file's directory and signal on events touching it.
fn watch_registry(
    path: &Path,
    tx: mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher, MenderError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| MenderError::Config(format!("Invalid registry path: {}", path.display())))?;

    let mut watcher = notify::recommended_watcher(move |res: Result<FsEvent, notify::Error>| {
        if let Ok(event) = res {
            if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                let _ = tx.send(());
            }
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(dir = %dir.display(), "Watching registry directory");
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_changes_only_reports_changed_fields() {
        let old = RegistryEntry {
            port: Some(9000),
            project_path: "/w/shop".into(),
            capabilities: vec!["fix".into()],
            role: Some("fixer".into()),
            ..Default::default()
        };
        let mut new = old.clone();
        assert!(entry_changes(&old, &new).is_empty());

        new.project_path = "/w/cart".into();
        new.agent_name = Some("Cart".into());
        let changes = entry_changes(&old, &new);
        assert_eq!(changes["project_path"], "/w/cart");
        assert_eq!(changes["project_name"], "cart");
        assert_eq!(changes["agent_name"], "Cart");
        assert!(!changes.contains_key("role"));
        assert!(!changes.contains_key("capabilities"));
    }

    #[test]
    fn test_port_change_is_not_a_delta() {
        let old = RegistryEntry { port: Some(1), ..Default::default() };
        let new = RegistryEntry { port: Some(2), ..Default::default() };
        assert!(entry_changes(&old, &new).is_empty());
    }
}
