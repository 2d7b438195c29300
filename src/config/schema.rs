use serde_json::{json, Value};
use std::sync::LazyLock;

pub static CONFIG_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "registry": {
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "poll_interval_secs": { "type": "integer", "minimum": 1 }
                },
                "additionalProperties": false
            },
            "agents": {
                "type": "object",
                "properties": {
                    "connect_timeout_secs": { "type": "integer", "minimum": 1 },
                    "recv_timeout_secs": { "type": "integer", "minimum": 1 },
                    "prompt_timeout_secs": { "type": "integer", "minimum": 1 },
                    "command_timeout_secs": { "type": "integer", "minimum": 1 },
                    "listen_poll_millis": { "type": "integer", "minimum": 1 },
                    "session_reset_delay_millis": { "type": "integer", "minimum": 0 }
                },
                "additionalProperties": false
            },
            "heartbeat": {
                "type": "object",
                "properties": {
                    "interval_secs": { "type": "integer", "minimum": 1 },
                    "ping_timeout_secs": { "type": "integer", "minimum": 1 },
                    "stale_threshold_secs": { "type": "integer", "minimum": 1 }
                },
                "additionalProperties": false
            },
            "activity": {
                "type": "object",
                "properties": {
                    "max_events": { "type": "integer", "minimum": 1 }
                },
                "additionalProperties": false
            },
            "storage": {
                "type": "object",
                "properties": {
                    "home": { "type": "string" },
                    "project_dir_name": { "type": "string", "minLength": 1 }
                },
                "additionalProperties": false
            },
            "http": {
                "type": "object",
                "properties": {
                    "timeout_secs": { "type": "integer", "minimum": 1 }
                },
                "additionalProperties": false
            }
        },
        "additionalProperties": false
    })
});
