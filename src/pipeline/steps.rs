use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::artifacts::RunDirectory;
use super::context::ExecutionContext;
use super::state::{PipelineState, TaskExecution};
use crate::agents::protocol::NEW_SESSION;
use crate::agents::{AgentConnection, AgentPool};
use crate::config::AgentsConfig;
use crate::errors::MenderError;
use crate::events::{Broadcaster, Event};
use crate::utils::truncation::truncate_snapshot;
use crate::workflow::{ConditionStep, HttpStep, NodeKind, PromptStep, PromptTemplateStore, WorkflowNode};

/// What a step needs from the outside world.
pub struct StepEnv<'a> {
    pub pool: &'a AgentPool,
    pub http: &'a reqwest::Client,
    pub prompts: &'a PromptTemplateStore,
    pub known_projects: &'a [String],
    pub project_path: Option<&'a str>,
    pub run_dir: &'a RunDirectory,
    pub agents: &'a AgentsConfig,
}

/// Successful step result.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Stored in node outputs, node results, the context and the artifact.
    pub result: Value,
    /// Trimmed view kept on the task.
    pub output_snapshot: Value,
    pub output_name: Option<String>,
}

/// Holds a task and publishes every change to the pipeline table and
/// subscribers.
pub struct TaskTracker<'a> {
    task: TaskExecution,
    broadcaster: &'a Broadcaster,
    pipelines: &'a DashMap<String, PipelineState>,
}

impl<'a> TaskTracker<'a> {
    pub fn new(
        task: TaskExecution,
        broadcaster: &'a Broadcaster,
        pipelines: &'a DashMap<String, PipelineState>,
    ) -> Self {
        let tracker = Self {
            task,
            broadcaster,
            pipelines,
        };
        tracker.publish();
        tracker
    }

    pub fn task(&self) -> &TaskExecution {
        &self.task
    }

    fn publish(&self) {
        if let Some(mut pipeline) = self.pipelines.get_mut(&self.task.failure_id) {
            pipeline
                .tasks
                .insert(self.task.node_id.clone(), self.task.clone());
        }
        self.broadcaster.broadcast(Event::TaskUpdate {
            task: self.task.clone(),
        });
    }

    pub fn assign(&mut self, agent_id: &str) {
        self.task.assign(agent_id);
        self.publish();
    }

    pub fn start(&mut self, input_snapshot: Value) {
        self.task.start(input_snapshot);
        self.publish();
    }

    pub fn complete(&mut self, output_snapshot: Value) {
        self.task.complete(output_snapshot);
        self.publish();
    }

    pub fn fail(&mut self, error: &MenderError) {
        self.task.fail(error.to_string(), error.classify().error_type);
        self.publish();
    }
}

/// The directly executable node kinds.
pub enum Step<'a> {
    Prompt(&'a PromptStep),
    Http(&'a HttpStep),
    Condition(&'a ConditionStep),
}

impl NodeKind {
    /// `None` for kinds a run passes over (start markers and unsupported kinds).
    pub fn step(&self) -> Option<Step<'_>> {
        match self {
            NodeKind::Prompt(step) => Some(Step::Prompt(step)),
            NodeKind::Http(step) => Some(Step::Http(step)),
            NodeKind::Condition(step) => Some(Step::Condition(step)),
            NodeKind::Start | NodeKind::Unsupported { .. } => None,
        }
    }
}

impl Step<'_> {
    pub async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
        env: &StepEnv<'_>,
        tracker: &mut TaskTracker<'_>,
    ) -> Result<StepOutput, MenderError> {
        match self {
            Step::Prompt(step) => step.execute(node, ctx, env, tracker).await,
            Step::Http(step) => step.execute(ctx, env, tracker).await,
            Step::Condition(step) => Ok(step.execute(ctx, tracker)),
        }
    }
}

impl PromptStep {
    pub async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
        env: &StepEnv<'_>,
        tracker: &mut TaskTracker<'_>,
    ) -> Result<StepOutput, MenderError> {
        let conn = self.resolve_agent(node, env).await?;
        tracker.assign(conn.instance_id());

        tokio::time::sleep(env.agents.session_reset_delay()).await;
        if let Err(e) = conn.send_command(NEW_SESSION, env.agents.command_timeout()).await {
            warn!(
                instance_id = %conn.instance_id(),
                error = %e,
                "Session reset failed, continuing with existing session"
            );
        }

        let (mut prompt, template_output) = self.build_prompt(node, ctx, env).await;
        prompt.push_str(&env.run_dir.listing().await);

        tracker.start(json!({ "prompt": truncate_snapshot(&prompt) }));
        info!(
            node_id = %node.id,
            instance_id = %conn.instance_id(),
            prompt_len = prompt.len(),
            "Sending prompt"
        );

        let response = conn.send_prompt(&prompt).await?;
        if let Some(error) = response.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(MenderError::NodeExecution(format!("Agent error: {}", error)));
        }

        let status = response.status_or_default();
        Ok(StepOutput {
            output_snapshot: json!({ "response": truncate_snapshot(&response.content) }),
            result: json!({ "response": response.content, "status": status }),
            output_name: self.output_name.clone().or(template_output),
        })
    }

    /// The node's agent if named, else one on the run's project, else any
    /// connected agent.
    async fn resolve_agent(
        &self,
        node: &WorkflowNode,
        env: &StepEnv<'_>,
    ) -> Result<Arc<AgentConnection>, MenderError> {
        if let Some(agent_id) = self.agent_id.as_deref().filter(|id| !id.is_empty()) {
            return match env.pool.get_connection(agent_id).await {
                Some(conn) if conn.is_connected() => Ok(conn),
                _ => Err(MenderError::NotConnected(agent_id.to_string())),
            };
        }

        if let Some(project) = env.project_path {
            if let Some(conn) = env.pool.get_agent_for_project(project).await {
                return Ok(conn);
            }
        }

        env.pool
            .get_connected_agent()
            .await
            .ok_or_else(|| MenderError::NoAgentAvailable(format!("prompt step '{}'", node.id)))
    }

    /// Template, else inline prompt, else a prompt synthesized from the
    /// node's label and its scoped context. Also returns the template's
    /// declared output name.
    async fn build_prompt(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
        env: &StepEnv<'_>,
    ) -> (String, Option<String>) {
        if let Some(template_id) = self.prompt_template_id.as_deref().filter(|id| !id.is_empty()) {
            match env
                .prompts
                .load(template_id, env.project_path, env.known_projects)
                .await
            {
                Ok(template) => {
                    debug!(node_id = %node.id, template_id = %template_id, "Using prompt template");
                    return (
                        ctx.substitute(&template.template),
                        Some(template.output_extraction.output_name),
                    );
                }
                Err(e) => warn!(node_id = %node.id, error = %e, "Prompt template unavailable"),
            }
        }

        if let Some(inline) = self.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            return (ctx.substitute(inline), None);
        }

        (self.synthesize(node, ctx), None)
    }

    fn synthesize(&self, node: &WorkflowNode, ctx: &ExecutionContext) -> String {
        let scoped = ctx.scoped(&self.declared_inputs());
        let context = serde_json::to_string_pretty(&Value::Object(scoped)).unwrap_or_default();

        let mut prompt = format!("You are helping fix a failing test.\n\nTask: {}\n", node.label);
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            prompt.push_str(&format!("Description: {}\n", description));
        }
        prompt.push_str(&format!(
            "\nContext:\n{}\n\nPlease analyze and provide your findings.",
            context
        ));
        prompt
    }
}

impl HttpStep {
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        env: &StepEnv<'_>,
        tracker: &mut TaskTracker<'_>,
    ) -> Result<StepOutput, MenderError> {
        let url = ctx.substitute(&self.url);
        let body = ctx.substitute(&self.body_text());
        let method = reqwest::Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| MenderError::NodeExecution(format!("Invalid HTTP method: {}", self.method)))?;

        tracker.start(json!({ "method": method.as_str(), "url": url }));

        let mut request = env.http.request(method, &url);
        for (name, value) in &self.headers {
            let value = match value {
                Value::String(s) => ctx.substitute(s),
                other => other.to_string(),
            };
            request = request.header(name.as_str(), value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).to_string()),
                )
            })
            .collect();
        let text = response.text().await?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        debug!(url = %url, status, "HTTP step complete");
        Ok(StepOutput {
            result: json!({ "status": status, "data": data, "headers": headers }),
            output_snapshot: json!({ "status": status }),
            output_name: None,
        })
    }
}

impl ConditionStep {
    /// Informational only: the result does not prune either branch.
    pub fn execute(&self, ctx: &ExecutionContext, tracker: &mut TaskTracker<'_>) -> StepOutput {
        let expression = self.expression();
        tracker.start(json!({ "condition": expression }));

        let result = ctx.evaluate_condition(&expression);
        let output = json!({
            "result": result,
            "branch": if result { "true" } else { "false" },
        });
        StepOutput {
            result: output.clone(),
            output_snapshot: output,
            output_name: None,
        }
    }
}
