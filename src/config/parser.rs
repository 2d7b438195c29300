use std::path::Path;
use crate::errors::MenderError;
use super::types::MenderConfig;
use super::schema::CONFIG_SCHEMA;
use tracing::{debug, warn};

pub async fn parse_config(path: &Path) -> Result<MenderConfig, MenderError> {
    if !path.exists() {
        return Err(MenderError::Config(format!("Config file not found: {}", path.display())));
    }

    let metadata = tokio::fs::metadata(path).await?;
    if metadata.len() > 1_048_576 {
        return Err(MenderError::Config("Config file exceeds 1MB limit".into()));
    }

    let content = tokio::fs::read_to_string(path).await?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&content)?;
    if yaml.is_null() {
        return Ok(MenderConfig::default());
    }

    // JSON Schema validation
    validate_schema(&yaml)?;

    // Parse into typed config
    let config: MenderConfig = serde_yaml::from_value(yaml)?;

    validate_semantics(&config)?;

    Ok(config)
}

/// Load the config at `path` if one was given, otherwise fall back to defaults.
pub async fn load_or_default(path: Option<&Path>) -> Result<MenderConfig, MenderError> {
    match path {
        Some(path) => parse_config(path).await,
        None => {
            debug!("No config file given, using defaults");
            Ok(MenderConfig::default())
        }
    }
}

/// Validate config against the JSON schema for structural correctness.
fn validate_schema(yaml: &serde_yaml::Value) -> Result<(), MenderError> {
    let json_value: serde_json::Value = serde_json::to_value(yaml)
        .map_err(|e| MenderError::Config(format!("Config conversion error: {}", e)))?;

    let compiled = jsonschema::JSONSchema::compile(&CONFIG_SCHEMA)
        .map_err(|e| MenderError::Config(format!("Schema compilation error: {}", e)))?;

    let result = compiled.validate(&json_value);
    if let Err(errors) = result {
        // Advisory only: serde decides what is fatal
        for e in errors {
            warn!(validation_error = %format!("{} at {}", e, e.instance_path), "Config schema warning");
        }
    }

    Ok(())
}

/// Reject values the engine cannot run with.
fn validate_semantics(config: &MenderConfig) -> Result<(), MenderError> {
    let zero_checks: &[(&str, u64)] = &[
        ("registry.poll_interval_secs", config.registry.poll_interval_secs),
        ("agents.connect_timeout_secs", config.agents.connect_timeout_secs),
        ("agents.recv_timeout_secs", config.agents.recv_timeout_secs),
        ("agents.prompt_timeout_secs", config.agents.prompt_timeout_secs),
        ("agents.command_timeout_secs", config.agents.command_timeout_secs),
        ("agents.listen_poll_millis", config.agents.listen_poll_millis),
        ("heartbeat.interval_secs", config.heartbeat.interval_secs),
        ("heartbeat.ping_timeout_secs", config.heartbeat.ping_timeout_secs),
        ("http.timeout_secs", config.http.timeout_secs),
    ];
    for (name, value) in zero_checks {
        if *value == 0 {
            return Err(MenderError::Config(format!("{} must be greater than zero", name)));
        }
    }

    if config.activity.max_events == 0 {
        return Err(MenderError::Config("activity.max_events must be greater than zero".into()));
    }

    if config.heartbeat.stale_threshold_secs <= config.heartbeat.interval_secs {
        warn!(
            stale_threshold_secs = config.heartbeat.stale_threshold_secs,
            interval_secs = config.heartbeat.interval_secs,
            "Stale threshold does not exceed the heartbeat interval; one missed probe will mark agents stale"
        );
    }

    Ok(())
}
