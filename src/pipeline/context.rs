use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::state::Failure;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([\w-]+(?:\.[\w-]+)?)\}\}").unwrap());

/// Failure fields a synthesized prompt sees when a node declares no inputs.
const BASIC_FIELDS: &[&str] = &[
    "test_file",
    "test_name",
    "error_message",
    "stack_trace",
    "expected",
    "actual",
];

/// Shared context of one run. Seeded from the failure; every completed node
/// adds its result under its id.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// `input` holds the normalized failure fields as a JSON string, `failure`
    /// the full record, and each normalized field is also a top-level key.
    pub fn for_failure(failure: &Failure) -> Self {
        let fields = failure.normalized_input();
        let mut values = Map::new();
        values.insert(
            "input".into(),
            Value::String(Value::Object(fields.clone()).to_string()),
        );
        values.insert(
            "failure".into(),
            serde_json::to_value(failure).unwrap_or(Value::Null),
        );
        for (key, value) in fields {
            values.entry(key).or_insert(value);
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Replace every `{{name}}` / `{{node.field}}` placeholder.
    ///
    /// Resolution order: a direct key (structured values yield `response`,
    /// then `data`, then themselves serialized), a nested field of a prior
    /// node's result, the `input` field, and finally the placeholder itself.
    pub fn substitute(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        PLACEHOLDER
            .replace_all(text, |caps: &Captures| {
                let name = &caps[1];
                self.resolve(name)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(value) = self.values.get(name) {
            return Some(match value {
                Value::Object(obj) => {
                    if let Some(response) = obj.get("response") {
                        value_text(response)
                    } else if let Some(data) = obj.get("data") {
                        value_text(data)
                    } else {
                        value.to_string()
                    }
                }
                other => value_text(other),
            });
        }

        if let Some((node_id, field)) = name.split_once('.') {
            if let Some(found) = self
                .values
                .get(node_id)
                .and_then(Value::as_object)
                .and_then(|obj| obj.get(field))
            {
                return Some(value_text(found));
            }
        }

        self.values.get("input").map(value_text)
    }

    /// Look up `name` or `node.field`.
    fn lookup(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.values.get(name) {
            return Some(value);
        }
        let (node_id, field) = name.split_once('.')?;
        self.values.get(node_id)?.as_object()?.get(field)
    }

    /// Evaluate a condition expression.
    ///
    /// Empty and `true` give true, `false` gives false. `left == right`
    /// compares a context value (its `status` field when structured) to the
    /// right-hand literal, ignoring case. Anything else is true.
    pub fn evaluate_condition(&self, expression: &str) -> bool {
        let expression = expression.trim();
        if expression.is_empty() || expression.eq_ignore_ascii_case("true") {
            return true;
        }
        if expression.eq_ignore_ascii_case("false") {
            return false;
        }

        let Some((left, right)) = expression.split_once("==") else {
            return true;
        };
        let left = left.trim();
        let right = right.trim().trim_matches(|c| c == '"' || c == '\'');

        let Some(value) = self.lookup(left) else {
            return true;
        };
        let actual = match value.as_object().and_then(|obj| obj.get("status")) {
            Some(status) => value_text(status),
            None => value_text(value),
        };
        actual.eq_ignore_ascii_case(right)
    }

    /// Only the named fields. With no names, the basic failure fields.
    pub fn scoped(&self, names: &[&str]) -> Map<String, Value> {
        let names: Vec<&str> = if names.is_empty() {
            BASIC_FIELDS.to_vec()
        } else {
            names.to_vec()
        };
        names
            .into_iter()
            .filter_map(|name| self.lookup(name).map(|v| (name.to_string(), v.clone())))
            .collect()
    }
}

/// Strings as-is, everything else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
