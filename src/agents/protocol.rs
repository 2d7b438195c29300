use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Frame type of an outbound prompt.
pub const PROMPT: &str = "copilotPrompt";
/// Frame type of an inbound prompt result.
pub const PROMPT_RESULT: &str = "copilotPromptResult";
/// Command that clears the agent's conversation state.
pub const NEW_SESSION: &str = "newAgentSession";
/// Status the agent sends while it is still working on a prompt.
pub const STATUS_EXECUTING: &str = "executing";

pub fn prompt_frame(prompt: &str, request_id: &str) -> String {
    json!({
        "type": PROMPT,
        "prompt": prompt,
        "request_id": request_id,
    })
    .to_string()
}

pub fn command_frame(command: &str) -> String {
    json!({ "type": command }).to_string()
}

/// Pending-slot key for a heartbeat probe.
pub fn pong_key(token: &str) -> String {
    format!("pong:{}", token)
}

/// Result of a prompt as reported by the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl PromptResponse {
    pub fn is_interim(&self) -> bool {
        self.status.as_deref() == Some(STATUS_EXECUTING)
    }

    pub fn status_or_default(&self) -> String {
        self.status.clone().unwrap_or_else(|| "success".to_string())
    }
}

/// Decoded inbound text frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    PromptResult { response: PromptResponse, raw: Value },
    /// Any other typed frame. Command replies carry the command name as type.
    Typed { kind: String, body: Value },
    Untyped(Value),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).map(str::to_string);
        match kind.as_deref() {
            Some(PROMPT_RESULT) => Ok(Inbound::PromptResult {
                response: PromptResponse::deserialize(&value)?,
                raw: value,
            }),
            Some(_) => Ok(Inbound::Typed {
                kind: kind.unwrap_or_default(),
                body: value,
            }),
            None => Ok(Inbound::Untyped(value)),
        }
    }
}
