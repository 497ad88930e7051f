//! JSON Schema subset for plugin settings and policy parameters.
//!
//! Supports `type`, `required`, `properties`, `additionalProperties: false`
//! and `enum`. Unknown keywords (`$id`, `title`, `description`) are ignored.

use std::fmt;

use serde_json::Value;

/// One schema violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer-like path of the offending value (`/` for the root)
    pub path: String,
    /// What is wrong
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `value` against `schema`. Empty result means valid.
#[must_use]
pub fn validate(value: &Value, schema: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();
    check(value, schema, "", &mut violations);
    violations
}

/// Join violations into one message.
#[must_use]
pub fn describe(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn check(value: &Value, schema: &Value, path: &str, out: &mut Vec<Violation>) {
    let at = if path.is_empty() { "/" } else { path };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !has_type(value, expected) {
            out.push(Violation {
                path: at.to_string(),
                message: format!("expected {expected}, got {}", type_name(value)),
            });
            // Nested checks on a mistyped value only add noise
            return;
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            out.push(Violation {
                path: at.to_string(),
                message: format!("must be one of {}", Value::Array(options.clone())),
            });
        }
    }

    let Value::Object(map) = value else {
        return;
    };

    for name in schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        if !map.contains_key(name) {
            out.push(Violation {
                path: format!("{path}/{name}"),
                message: "required property is missing".to_string(),
            });
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, child) in map {
        match properties.and_then(|p| p.get(key)) {
            Some(child_schema) => check(child, child_schema, &format!("{path}/{key}"), out),
            None if closed => out.push(Violation {
                path: format!("{path}/{key}"),
                message: "unknown property".to_string(),
            }),
            None => {}
        }
    }
}

fn has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
