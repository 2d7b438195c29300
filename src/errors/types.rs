use thiserror::Error;

#[derive(Debug, Error)]
pub enum MenderError {
    #[error("Agent unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Agent not connected: {0}")]
    NotConnected(String),

    #[error("Timed out: {0}")]
    RequestTimeout(String),

    #[error("{0}")]
    NodeExecution(String),

    #[error("No agent available for {0}")]
    NoAgentAvailable(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Failure not found: {0}")]
    FailureNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
