use super::types::MenderError;

#[derive(Debug, Clone)]
pub struct ErrorClassification {
    pub error_type: &'static str,
    /// Raised by an agent channel. These become health changes and
    /// broadcasts; they never escape a listener or heartbeat loop.
    pub connection_level: bool,
}

impl MenderError {
    /// Classify this error for logging and for routing connection faults into health state.
    pub fn classify(&self) -> ErrorClassification {
        match self {
            // Agent channel faults
            MenderError::ConnectionUnavailable(_) => ErrorClassification {
                error_type: "ConnectionUnavailable",
                connection_level: true,
            },
            MenderError::NotConnected(_) => ErrorClassification {
                error_type: "NotConnected",
                connection_level: true,
            },
            MenderError::RequestTimeout(_) => ErrorClassification {
                error_type: "RequestTimeout",
                connection_level: true,
            },

            // Run-level faults
            MenderError::NodeExecution(_) => ErrorClassification {
                error_type: "NodeExecutionError",
                connection_level: false,
            },
            MenderError::NoAgentAvailable(_) => ErrorClassification {
                error_type: "NoAgentAvailable",
                connection_level: false,
            },
            MenderError::WorkflowNotFound(_) => ErrorClassification {
                error_type: "WorkflowNotFound",
                connection_level: false,
            },
            MenderError::FailureNotFound(_) => ErrorClassification {
                error_type: "FailureNotFound",
                connection_level: false,
            },
            MenderError::InvalidState(_) => ErrorClassification {
                error_type: "InvalidState",
                connection_level: false,
            },
            MenderError::Template(_) => ErrorClassification {
                error_type: "TemplateError",
                connection_level: false,
            },
            MenderError::Http(_) => ErrorClassification {
                error_type: "HttpError",
                connection_level: false,
            },

            // Ambient
            MenderError::Config(_) => ErrorClassification {
                error_type: "ConfigError",
                connection_level: false,
            },
            MenderError::Io(_) => ErrorClassification {
                error_type: "IoError",
                connection_level: false,
            },
            MenderError::Json(_) => ErrorClassification {
                error_type: "JsonError",
                connection_level: false,
            },
            MenderError::Yaml(_) => ErrorClassification {
                error_type: "YamlError",
                connection_level: false,
            },
            MenderError::Watch(_) => ErrorClassification {
                error_type: "WatchError",
                connection_level: false,
            },
            MenderError::Internal(_) => ErrorClassification {
                error_type: "InternalError",
                connection_level: false,
            },
        }
    }
}
