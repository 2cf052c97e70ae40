use crate::error::ToolError;
use serde_json::{Map, Value};

/// Checks `args` against the subset of JSON Schema the tools declare:
/// an object with typed `properties`, a `required` list and optionally
/// `additionalProperties: false`.
pub fn validate_arguments(
    tool: &str,
    schema: &Value,
    args: &Value,
) -> Result<Map<String, Value>, ToolError> {
    let args = match args {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(ToolError::invalid_arguments(
                tool,
                format!("expected an object, got {}", json_type(other)),
            ));
        }
    };

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if args.get(key).is_none_or(Value::is_null) {
                return Err(ToolError::invalid_arguments(
                    tool,
                    format!("missing required parameter '{key}'"),
                ));
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in &args {
        let declared = properties.and_then(|p| p.get(key));
        match declared.and_then(|d| d.get("type")).and_then(Value::as_str) {
            Some(expected) if !matches_type(expected, value) => {
                return Err(ToolError::invalid_arguments(
                    tool,
                    format!(
                        "parameter '{key}' must be {expected}, got {}",
                        json_type(value)
                    ),
                ));
            }
            _ => {}
        }
        if declared.is_none() && closed {
            return Err(ToolError::invalid_arguments(
                tool,
                format!("unexpected parameter '{key}'"),
            ));
        }
    }

    Ok(args)
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
