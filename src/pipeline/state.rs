use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::workflow::WorkflowNode;

fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &hex[..8])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Escalated,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown failure status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Assigned => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Skipped => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Transitions only move forward within one run.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Ingestion contract for a reported test failure. Accepts camelCase or
/// snake_case keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInput {
    #[serde(default, alias = "test_file")]
    pub test_file: String,
    #[serde(default, alias = "test_name")]
    pub test_name: String,
    #[serde(default, alias = "error_message")]
    pub error_message: String,
    #[serde(default, alias = "stack_trace")]
    pub stack_trace: Option<Value>,
    #[serde(default)]
    pub expected: Option<Value>,
    #[serde(default)]
    pub actual: Option<Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// A reported test failure plus its run status and accumulated results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub id: String,
    pub test_file: String,
    pub test_name: String,
    pub error_message: String,
    pub stack_trace: Option<Value>,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
    pub context: Map<String, Value>,
    pub status: FailureStatus,
    pub workflow_id: Option<String>,
    pub current_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub node_results: Map<String, Value>,
}

impl Failure {
    pub fn new(input: FailureInput) -> Self {
        let now = Utc::now();
        let or_unknown = |s: String| if s.is_empty() { "unknown".to_string() } else { s };
        Self {
            id: short_id("fail"),
            test_file: or_unknown(input.test_file),
            test_name: or_unknown(input.test_name),
            error_message: input.error_message,
            stack_trace: input.stack_trace,
            expected: input.expected,
            actual: input.actual,
            context: input.context,
            status: FailureStatus::Pending,
            workflow_id: None,
            current_node_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            retry_count: 0,
            node_results: Map::new(),
        }
    }

    pub fn set_status(&mut self, status: FailureStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Failure fields flattened with the free-form context. Context keys
    /// override the basic fields.
    pub fn normalized_input(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("test_file".into(), Value::String(self.test_file.clone()));
        fields.insert("test_name".into(), Value::String(self.test_name.clone()));
        fields.insert("error_message".into(), Value::String(self.error_message.clone()));
        for (key, value) in [
            ("stack_trace", &self.stack_trace),
            ("expected", &self.expected),
            ("actual", &self.actual),
        ] {
            let value = value.clone().unwrap_or_else(|| Value::String(String::new()));
            fields.insert(key.into(), value);
        }
        for (key, value) in &self.context {
            fields.insert(key.clone(), value.clone());
        }
        fields
    }

    /// Project the failure belongs to, when the submitter supplied one.
    pub fn project_path(&self) -> Option<String> {
        ["project_path", "projectPath"]
            .iter()
            .find_map(|key| self.context.get(*key).and_then(Value::as_str))
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }
}

/// Record of one node's execution within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub failure_id: String,
    pub node_id: String,
    pub node_type: String,
    pub label: String,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<String>,
    pub input_snapshot: Value,
    pub output_snapshot: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl TaskExecution {
    pub fn new(failure_id: &str, node: &WorkflowNode) -> Self {
        Self {
            id: short_id("task"),
            failure_id: failure_id.to_string(),
            node_id: node.id.clone(),
            node_type: node.kind.type_name().to_string(),
            label: node.label.clone(),
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            input_snapshot: Value::Object(Map::new()),
            output_snapshot: None,
            error: None,
            error_type: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
        }
    }

    fn advance(&mut self, next: TaskStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            debug!(task_id = %self.id, from = ?self.status, to = ?next, "Ignoring backward task transition");
            false
        }
    }

    pub fn assign(&mut self, agent_id: &str) {
        if self.advance(TaskStatus::Assigned) {
            self.assigned_agent_id = Some(agent_id.to_string());
        }
    }

    pub fn start(&mut self, input_snapshot: Value) {
        if self.advance(TaskStatus::Running) {
            self.input_snapshot = input_snapshot;
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, output_snapshot: Value) {
        if self.advance(TaskStatus::Completed) {
            self.output_snapshot = Some(output_snapshot);
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn fail(&mut self, error: String, error_type: &str) {
        if self.advance(TaskStatus::Failed) {
            self.error = Some(error);
            self.error_type = Some(error_type.to_string());
            self.completed_at = Some(Utc::now());
        }
    }
}

/// One run of one failure against one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub failure_id: String,
    pub workflow_id: String,
    pub status: FailureStatus,
    pub execution_order: Vec<String>,
    pub current_index: usize,
    pub node_outputs: Map<String, Value>,
    pub tasks: BTreeMap<String, TaskExecution>,
    pub run_directory: PathBuf,
    pub project_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    pub fn new(
        failure_id: &str,
        workflow_id: &str,
        execution_order: Vec<String>,
        run_directory: PathBuf,
        project_path: Option<String>,
    ) -> Self {
        Self {
            failure_id: failure_id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: FailureStatus::Running,
            execution_order,
            current_index: 0,
            node_outputs: Map::new(),
            tasks: BTreeMap::new(),
            run_directory,
            project_path,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Counts per status plus the success rate over finished runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub escalated: usize,
    /// Percentage of completed over completed + failed, one decimal.
    pub success_rate: f64,
}

impl FailureStats {
    pub fn from_statuses(statuses: impl IntoIterator<Item = FailureStatus>) -> Self {
        let mut stats = Self::default();
        for status in statuses {
            stats.total += 1;
            match status {
                FailureStatus::Pending => stats.pending += 1,
                FailureStatus::Running => stats.running += 1,
                FailureStatus::Completed => stats.completed += 1,
                FailureStatus::Failed => stats.failed += 1,
                FailureStatus::Escalated => stats.escalated += 1,
            }
        }
        let finished = stats.completed + stats.failed;
        if finished > 0 {
            let rate = stats.completed as f64 / finished as f64 * 100.0;
            stats.success_rate = (rate * 10.0).round() / 10.0;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NodeKind;

    #[test]
    fn test_failure_ids_and_defaults() {
        let failure = Failure::new(FailureInput::default());
        assert!(failure.id.starts_with("fail-"));
        assert_eq!(failure.id.len(), 13);
        assert_eq!(failure.test_file, "unknown");
        assert_eq!(failure.status, FailureStatus::Pending);
        assert!(failure.node_results.is_empty());
    }

    #[test]
    fn test_input_accepts_both_key_styles() {
        let camel: FailureInput =
            serde_json::from_str(r#"{"testFile": "a.spec.ts", "errorMessage": "boom"}"#).unwrap();
        let snake: FailureInput =
            serde_json::from_str(r#"{"test_file": "a.spec.ts", "error_message": "boom"}"#).unwrap();
        assert_eq!(camel.test_file, snake.test_file);
        assert_eq!(camel.error_message, "boom");
    }

    #[test]
    fn test_input_keeps_structured_assertion_values() {
        let input: FailureInput =
            serde_json::from_str(r#"{"testName":"t","expected":42,"actual":{"total":41}}"#).unwrap();
        let fields = Failure::new(input).normalized_input();
        assert_eq!(fields["expected"], 42);
        assert_eq!(fields["actual"]["total"], 41);
        assert_eq!(fields["stack_trace"], "");
    }

    #[test]
    fn test_normalized_input_merges_context() {
        let mut context = Map::new();
        context.insert("selector".into(), Value::String("#buy".into()));
        context.insert("project_path".into(), Value::String("/w/shop".into()));
        let failure = Failure::new(FailureInput {
            test_name: "checkout".into(),
            context,
            ..Default::default()
        });

        let fields = failure.normalized_input();
        assert_eq!(fields["test_name"], "checkout");
        assert_eq!(fields["stack_trace"], "");
        assert_eq!(fields["selector"], "#buy");
        assert_eq!(failure.project_path().as_deref(), Some("/w/shop"));
    }

    #[test]
    fn test_task_transitions_forward_only() {
        let node = WorkflowNode::new("n1", NodeKind::Start);
        let mut task = TaskExecution::new("fail-1", &node);
        assert!(task.id.starts_with("task-"));

        task.start(Value::Null);
        assert_eq!(task.status, TaskStatus::Running);
        task.assign("a1");
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.assigned_agent_id.is_none());

        task.fail("boom".into(), "NodeExecutionError");
        task.complete(Value::Null);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_stats_success_rate() {
        use FailureStatus::*;
        let stats = FailureStats::from_statuses([Completed, Completed, Failed, Pending, Escalated]);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.success_rate, 66.7);

        assert_eq!(FailureStats::from_statuses([]).success_rate, 0.0);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Failed".parse::<FailureStatus>().unwrap(), FailureStatus::Failed);
        assert!("done".parse::<FailureStatus>().is_err());
    }
}
