use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{AgentPool, HeartbeatMonitor};
use crate::config::MenderConfig;
use crate::errors::MenderError;
use crate::events::Broadcaster;
use crate::pipeline::PipelineExecutor;
use crate::registry::{FileRegistry, Reconciler, RegistrySource};

/// Every long-lived service, built once and shared.
pub struct Engine {
    config: MenderConfig,
    broadcaster: Arc<Broadcaster>,
    pool: Arc<AgentPool>,
    heartbeat: Arc<HeartbeatMonitor>,
    reconciler: Arc<Reconciler>,
    executor: Arc<PipelineExecutor>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: MenderConfig, registry: Arc<dyn RegistrySource>) -> Result<Self, MenderError> {
        let broadcaster = Arc::new(Broadcaster::new(config.activity.max_events));
        let pool = Arc::new(AgentPool::new(
            broadcaster.clone(),
            config.agents.clone(),
            config.heartbeat.ping_timeout(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            pool.clone(),
            broadcaster.clone(),
            config.heartbeat.interval(),
            config.heartbeat.stale_threshold(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            pool.clone(),
            broadcaster.clone(),
            Duration::from_secs(config.registry.poll_interval_secs),
        ));
        let executor = Arc::new(PipelineExecutor::new(
            pool.clone(),
            broadcaster.clone(),
            registry,
            config.storage.clone(),
            config.agents.clone(),
            &config.http,
        )?);

        Ok(Self {
            config,
            broadcaster,
            pool,
            heartbeat,
            reconciler,
            executor,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Engine reading the registry file named by the config.
    pub fn from_config(config: MenderConfig) -> Result<Self, MenderError> {
        let registry: Arc<dyn RegistrySource> = Arc::new(FileRegistry::new(config.registry_path()));
        Self::new(config, registry)
    }

    pub fn config(&self) -> &MenderConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.executor
    }

    /// Spawn the reconciler, heartbeat and pipeline loops.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Engine already started");
            return;
        }
        tasks.push(tokio::spawn(self.reconciler.clone().run(self.cancel.child_token())));
        tasks.push(tokio::spawn(self.heartbeat.clone().run(self.cancel.child_token())));
        tasks.push(tokio::spawn(self.executor.clone().run(self.cancel.child_token())));
        info!("Engine started");
    }

    /// Wait until at least one agent is connected, up to `limit`.
    pub async fn wait_for_agents(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if !self.pool.connected_ids().await.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Cancel every loop, wait for them, then drop all agent connections.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.pool.disconnect_all().await;
        info!("Engine stopped");
    }
}
