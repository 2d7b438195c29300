use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::pool::AgentSummary;
use crate::pipeline::state::{Failure, TaskExecution};

/// Notifications fanned out to every subscriber. Each variant serializes as a
/// tagged object, e.g. `{"type":"agent_removed","instance_id":"a1"}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    FailureCreated { failure: Failure },
    FailureUpdate { failure: Failure },
    TaskUpdate { task: TaskExecution },
    PipelineComplete { failure_id: String },
    AgentAdded { agent: AgentSummary },
    AgentDelta { instance_id: String, changes: Map<String, Value> },
    AgentRemoved { instance_id: String },
    Activity { event: ActivityEvent },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::FailureCreated { .. } => "failure_created",
            Event::FailureUpdate { .. } => "failure_update",
            Event::TaskUpdate { .. } => "task_update",
            Event::PipelineComplete { .. } => "pipeline_complete",
            Event::AgentAdded { .. } => "agent_added",
            Event::AgentDelta { .. } => "agent_delta",
            Event::AgentRemoved { .. } => "agent_removed",
            Event::Activity { .. } => "activity",
        }
    }
}

/// One entry of the activity ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = Event::AgentRemoved { instance_id: "a1".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_removed");
        assert_eq!(json["instance_id"], "a1");
        assert_eq!(event.kind(), "agent_removed");
    }

    #[test]
    fn test_activity_fields_flattened() {
        let mut fields = Map::new();
        fields.insert("prompt".into(), Value::String("fix it".into()));
        let event = ActivityEvent {
            timestamp: Utc::now(),
            event_type: "prompt_sent".into(),
            instance_id: "a1".into(),
            port: Some(9000),
            fields,
        };
        let json = serde_json::to_value(Event::Activity { event }).unwrap();
        assert_eq!(json["type"], "activity");
        assert_eq!(json["event"]["event_type"], "prompt_sent");
        assert_eq!(json["event"]["prompt"], "fix it");
        assert_eq!(json["event"]["port"], 9000);
    }
}
