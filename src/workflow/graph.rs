use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const START: &str = "workflowStart";
pub const PROMPT: &str = "promptBlock";
pub const HTTP: &str = "httpRequest";
pub const CONDITION: &str = "condition";

/// Immutable workflow input: typed nodes plus directed edges.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A node decoded from `{id, type, data}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawNode")]
pub struct WorkflowNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Closed set of node kinds. Anything the engine does not execute
/// (loop, router, aggregator, end markers) decodes to `Unsupported`.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    Prompt(PromptStep),
    Http(HttpStep),
    Condition(ConditionStep),
    Unsupported { kind: String },
}

impl NodeKind {
    pub fn type_name(&self) -> &str {
        match self {
            NodeKind::Start => START,
            NodeKind::Prompt(_) => PROMPT,
            NodeKind::Http(_) => HTTP,
            NodeKind::Condition(_) => CONDITION,
            NodeKind::Unsupported { kind } => kind,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, NodeKind::Start)
    }
}

#[derive(Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawNode> for WorkflowNode {
    type Error = serde_json::Error;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let label = raw
            .data
            .get("label")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(&raw.id)
            .to_string();
        // Null fields take their defaults.
        let data = match raw.data {
            Value::Object(mut fields) => {
                fields.retain(|_, v| !v.is_null());
                Value::Object(fields)
            }
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let kind = match raw.kind.as_str() {
            START => NodeKind::Start,
            PROMPT => NodeKind::Prompt(serde_json::from_value(data)?),
            HTTP => NodeKind::Http(serde_json::from_value(data)?),
            CONDITION => NodeKind::Condition(serde_json::from_value(data)?),
            _ => NodeKind::Unsupported { kind: raw.kind.clone() },
        };
        Ok(Self {
            id: raw.id,
            label,
            kind,
        })
    }
}

/// Upstream variable a prompt step declares as input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableBinding {
    pub variable_name: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptStep {
    pub description: Option<String>,
    pub agent_id: Option<String>,
    pub prompt_template_id: Option<String>,
    pub prompt: Option<String>,
    pub variable_bindings: Vec<VariableBinding>,
    pub output_name: Option<String>,
}

impl PromptStep {
    /// Names of the context fields this step wants to see.
    pub fn declared_inputs(&self) -> Vec<&str> {
        self.variable_bindings
            .iter()
            .map(|b| b.variable_name.as_str())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpStep {
    pub method: String,
    pub url: String,
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
}

impl Default for HttpStep {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            url: String::new(),
            headers: Map::new(),
            body: None,
        }
    }
}

impl HttpStep {
    /// Body as text; structured bodies are serialized.
    pub fn body_text(&self) -> String {
        match &self.body {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionStep {
    pub condition: String,
    pub variable: Option<String>,
    pub operator: Option<String>,
    pub value: Option<Value>,
}

impl ConditionStep {
    /// Expression to evaluate. Structured `variable`/`operator`/`value`
    /// fields are used when no `condition` text is given.
    pub fn expression(&self) -> String {
        if !self.condition.trim().is_empty() {
            return self.condition.clone();
        }
        match (&self.variable, &self.operator) {
            (Some(variable), Some(operator)) => {
                let op = match operator.as_str() {
                    "equals" | "eq" | "=" => "==",
                    other => other,
                };
                let value = match &self.value {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                format!("{} {} {}", variable, op, value)
            }
            _ => String::new(),
        }
    }
}
