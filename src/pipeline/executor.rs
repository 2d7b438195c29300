use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifacts::RunDirectory;
use super::context::ExecutionContext;
use super::state::{
    Failure, FailureInput, FailureStats, FailureStatus, PipelineState, TaskExecution,
};
use super::steps::{StepEnv, TaskTracker};
use crate::agents::AgentPool;
use crate::config::{AgentsConfig, HttpConfig, StorageConfig};
use crate::errors::MenderError;
use crate::events::{Broadcaster, Event};
use crate::registry::RegistrySource;
use crate::workflow::{execution_order, PromptTemplateStore, WorkflowStore};

/// Workflow applied to failures queued without an explicit one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveWorkflow {
    pub workflow_id: String,
    pub project_path: Option<String>,
}

/// Runs workflows against failures, one failure at a time in FIFO order.
pub struct PipelineExecutor {
    pool: Arc<AgentPool>,
    broadcaster: Arc<Broadcaster>,
    registry: Arc<dyn RegistrySource>,
    workflows: WorkflowStore,
    prompts: PromptTemplateStore,
    storage: StorageConfig,
    agents: AgentsConfig,
    http: reqwest::Client,
    failures: DashMap<String, Failure>,
    pipelines: DashMap<String, PipelineState>,
    active: StdRwLock<Option<ActiveWorkflow>>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    queued: AtomicUsize,
}

impl PipelineExecutor {
    pub fn new(
        pool: Arc<AgentPool>,
        broadcaster: Arc<Broadcaster>,
        registry: Arc<dyn RegistrySource>,
        storage: StorageConfig,
        agents: AgentsConfig,
        http: &HttpConfig,
    ) -> Result<Self, MenderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(http.timeout_secs))
            .build()?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Ok(Self {
            pool,
            broadcaster,
            registry,
            workflows: WorkflowStore::new(storage.clone()),
            prompts: PromptTemplateStore::new(storage.clone()),
            storage,
            agents,
            http: client,
            failures: DashMap::new(),
            pipelines: DashMap::new(),
            active: StdRwLock::new(None),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            queued: AtomicUsize::new(0),
        })
    }

    // ---- Failures ----

    pub fn create_failure(&self, input: FailureInput) -> Failure {
        let failure = Failure::new(input);
        info!(
            failure_id = %failure.id,
            test_file = %failure.test_file,
            test_name = %failure.test_name,
            "Failure ingested"
        );
        self.failures.insert(failure.id.clone(), failure.clone());
        self.broadcaster.broadcast(Event::FailureCreated {
            failure: failure.clone(),
        });
        failure
    }

    pub fn get_failure(&self, failure_id: &str) -> Option<Failure> {
        self.failures.get(failure_id).map(|f| f.clone())
    }

    /// Newest first.
    pub fn all_failures(&self) -> Vec<Failure> {
        let mut failures: Vec<Failure> = self.failures.iter().map(|f| f.clone()).collect();
        failures.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        failures
    }

    pub fn failures_by_status(&self, status: FailureStatus) -> Vec<Failure> {
        self.all_failures()
            .into_iter()
            .filter(|f| f.status == status)
            .collect()
    }

    pub fn stats(&self) -> FailureStats {
        FailureStats::from_statuses(self.failures.iter().map(|f| f.status))
    }

    pub fn pipeline(&self, failure_id: &str) -> Option<PipelineState> {
        self.pipelines.get(failure_id).map(|p| p.clone())
    }

    /// Failures waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn update_failure(&self, failure_id: &str, f: impl FnOnce(&mut Failure)) -> Option<Failure> {
        let mut failure = self.failures.get_mut(failure_id)?;
        f(&mut failure);
        Some(failure.clone())
    }

    fn update_pipeline(&self, failure_id: &str, f: impl FnOnce(&mut PipelineState)) {
        if let Some(mut pipeline) = self.pipelines.get_mut(failure_id) {
            f(&mut pipeline);
        }
    }

    fn publish_failure(&self, failure: Option<Failure>) {
        if let Some(failure) = failure {
            self.broadcaster.broadcast(Event::FailureUpdate { failure });
        }
    }

    // ---- Workflows ----

    /// Verify the workflow loads, then make it the default for queueing.
    pub async fn set_active_workflow(
        &self,
        workflow_id: &str,
        project_path: Option<String>,
    ) -> Result<ActiveWorkflow, MenderError> {
        let graph = self
            .workflows
            .load(workflow_id, project_path.as_deref())
            .await?;
        let active = ActiveWorkflow {
            workflow_id: workflow_id.to_string(),
            project_path,
        };
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(active.clone());
        info!(
            workflow_id = %workflow_id,
            name = graph.name.as_deref().unwrap_or(workflow_id),
            "Active workflow set"
        );
        Ok(active)
    }

    pub fn active_workflow(&self) -> Option<ActiveWorkflow> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ---- Queueing and operator actions ----

    /// Queue against `workflow_id`, or the active workflow when none given.
    pub fn queue_failure(&self, failure_id: &str, workflow_id: Option<&str>) -> Result<(), MenderError> {
        if !self.failures.contains_key(failure_id) {
            return Err(MenderError::FailureNotFound(failure_id.to_string()));
        }
        let workflow_id = match workflow_id {
            Some(id) => id.to_string(),
            None => self
                .active_workflow()
                .map(|a| a.workflow_id)
                .ok_or_else(|| MenderError::WorkflowNotFound("no workflow given and none active".into()))?,
        };

        let failure = self.update_failure(failure_id, |f| {
            f.workflow_id = Some(workflow_id.clone());
            f.set_status(FailureStatus::Pending);
        });
        self.publish_failure(failure);

        self.queue_tx
            .send(failure_id.to_string())
            .map_err(|_| MenderError::Internal("pipeline queue closed".into()))?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        info!(failure_id = %failure_id, workflow_id = %workflow_id, "Failure queued");
        Ok(())
    }

    /// Clear results and requeue a failed or escalated failure against its
    /// previous workflow (or the active one).
    pub fn retry(&self, failure_id: &str) -> Result<(), MenderError> {
        let failure = self
            .get_failure(failure_id)
            .ok_or_else(|| MenderError::FailureNotFound(failure_id.to_string()))?;
        if !matches!(failure.status, FailureStatus::Failed | FailureStatus::Escalated) {
            return Err(MenderError::InvalidState(format!(
                "cannot retry failure with status '{}'",
                failure.status
            )));
        }
        let workflow_id = failure
            .workflow_id
            .clone()
            .or_else(|| self.active_workflow().map(|a| a.workflow_id))
            .ok_or_else(|| MenderError::WorkflowNotFound(format!("no workflow set for {}", failure_id)))?;

        self.update_failure(failure_id, |f| {
            f.retry_count += 1;
            f.node_results.clear();
            f.current_node_id = None;
            f.completed_at = None;
        });
        info!(failure_id = %failure_id, retry = failure.retry_count + 1, "Retrying failure");
        self.queue_failure(failure_id, Some(&workflow_id))
    }

    /// Move a failed or pending failure to manual handling.
    pub fn escalate(&self, failure_id: &str) -> Result<Failure, MenderError> {
        let current = self
            .get_failure(failure_id)
            .ok_or_else(|| MenderError::FailureNotFound(failure_id.to_string()))?;
        if !matches!(current.status, FailureStatus::Failed | FailureStatus::Pending) {
            return Err(MenderError::InvalidState(format!(
                "cannot escalate failure with status '{}'",
                current.status
            )));
        }
        let failure = self
            .update_failure(failure_id, |f| f.set_status(FailureStatus::Escalated))
            .ok_or_else(|| MenderError::FailureNotFound(failure_id.to_string()))?;
        warn!(failure_id = %failure_id, "Failure escalated");
        self.broadcaster.broadcast(Event::FailureUpdate {
            failure: failure.clone(),
        });
        Ok(failure)
    }

    // ---- Execution ----

    /// Consume the queue until cancelled. Runs never overlap.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.queue_rx.lock().await.take() else {
            warn!("Pipeline loop already running");
            return;
        };
        info!("Pipeline executor started");
        loop {
            let failure_id = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            self.queued.fetch_sub(1, Ordering::SeqCst);

            if let Err(e) = self.execute_pipeline(&failure_id).await {
                warn!(failure_id = %failure_id, error = %e, "Pipeline run skipped");
            }
        }
        *self.queue_rx.lock().await = Some(rx);
        info!("Pipeline executor stopped");
    }

    /// Run one pending failure to a terminal status. A failure that left
    /// `Pending` while queued (escalated, say) is returned untouched. Errors
    /// only when the failure cannot be run at all; node failures are reported
    /// through the status.
    pub async fn execute_pipeline(&self, failure_id: &str) -> Result<FailureStatus, MenderError> {
        let failure = self
            .get_failure(failure_id)
            .ok_or_else(|| MenderError::FailureNotFound(failure_id.to_string()))?;
        if failure.status != FailureStatus::Pending {
            debug!(failure_id = %failure_id, status = %failure.status, "Not pending, leaving alone");
            return Ok(failure.status);
        }
        let workflow_id = failure
            .workflow_id
            .clone()
            .ok_or_else(|| MenderError::InvalidState(format!("{} has no workflow", failure_id)))?;
        let project_path = failure
            .project_path()
            .or_else(|| self.active_workflow().and_then(|a| a.project_path));

        let graph = match self.workflows.load(&workflow_id, project_path.as_deref()).await {
            Ok(graph) => graph,
            Err(e) => {
                warn!(failure_id = %failure_id, workflow_id = %workflow_id, error = %e, "Workflow unavailable");
                let failed = self.update_failure(failure_id, |f| f.set_status(FailureStatus::Failed));
                self.publish_failure(failed);
                return Ok(FailureStatus::Failed);
            }
        };

        let order = execution_order(&graph);
        let run_dir = RunDirectory::for_failure(&self.storage, project_path.as_deref(), failure_id);
        if let Err(e) = run_dir.prepare().await {
            warn!(path = %run_dir.path().display(), error = %e, "Run directory unavailable");
        }

        self.pipelines.insert(
            failure_id.to_string(),
            PipelineState::new(
                failure_id,
                &workflow_id,
                order.clone(),
                run_dir.path().to_path_buf(),
                project_path.clone(),
            ),
        );
        let running = self.update_failure(failure_id, |f| {
            f.current_node_id = None;
            f.set_status(FailureStatus::Running);
        });
        let mut ctx = match &running {
            Some(failure) => ExecutionContext::for_failure(failure),
            None => ExecutionContext::for_failure(&failure),
        };
        self.publish_failure(running);

        info!(
            failure_id = %failure_id,
            workflow_id = %workflow_id,
            nodes = order.len(),
            "Pipeline started"
        );

        let known_projects = self.registry.snapshot().await.project_paths();
        let env = StepEnv {
            pool: &self.pool,
            http: &self.http,
            prompts: &self.prompts,
            known_projects: &known_projects,
            project_path: project_path.as_deref(),
            run_dir: &run_dir,
            agents: &self.agents,
        };

        let mut step_number = 0;
        for (index, node_id) in order.iter().enumerate() {
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            let Some(step) = node.kind.step() else {
                debug!(node_id = %node_id, kind = node.kind.type_name(), "Passing over node");
                continue;
            };
            step_number += 1;

            self.update_pipeline(failure_id, |p| p.current_index = index);
            self.update_failure(failure_id, |f| {
                f.current_node_id = Some(node_id.clone());
                f.updated_at = Utc::now();
            });

            let mut tracker = TaskTracker::new(
                TaskExecution::new(failure_id, node),
                &self.broadcaster,
                &self.pipelines,
            );

            match step.execute(node, &ctx, &env, &mut tracker).await {
                Ok(output) => {
                    tracker.complete(output.output_snapshot.clone());
                    self.update_pipeline(failure_id, |p| {
                        p.node_outputs.insert(node_id.clone(), output.result.clone());
                    });
                    self.update_failure(failure_id, |f| {
                        f.node_results.insert(node_id.clone(), output.result.clone());
                    });
                    if let Err(e) = run_dir
                        .write_step(step_number, node, output.output_name.as_deref(), &output.result)
                        .await
                    {
                        warn!(node_id = %node_id, error = %e, "Failed to write step artifact");
                    }
                    if let Some(name) = output.output_name.as_deref() {
                        if name != node_id && ctx.get(name).is_none() {
                            ctx.insert(name, output.result.clone());
                        }
                    }
                    ctx.insert(node_id.clone(), output.result);
                    debug!(failure_id = %failure_id, node_id = %node_id, "Node completed");
                }
                Err(e) => {
                    let classification = e.classify();
                    warn!(
                        failure_id = %failure_id,
                        node_id = %node_id,
                        error = %e,
                        error_type = classification.error_type,
                        "Node failed, aborting run"
                    );
                    tracker.fail(&e);
                    self.update_pipeline(failure_id, |p| {
                        p.status = FailureStatus::Failed;
                        p.completed_at = Some(Utc::now());
                    });
                    let failed = self.update_failure(failure_id, |f| f.set_status(FailureStatus::Failed));
                    self.publish_failure(failed);
                    return Ok(FailureStatus::Failed);
                }
            }
        }

        self.update_pipeline(failure_id, |p| {
            p.status = FailureStatus::Completed;
            p.completed_at = Some(Utc::now());
        });
        let completed = self.update_failure(failure_id, |f| {
            f.set_status(FailureStatus::Completed);
            f.completed_at = Some(f.updated_at);
            f.current_node_id = None;
        });
        self.publish_failure(completed);
        self.broadcaster.broadcast(Event::PipelineComplete {
            failure_id: failure_id.to_string(),
        });
        info!(failure_id = %failure_id, steps = step_number, "Pipeline completed");

        Ok(FailureStatus::Completed)
    }
}
