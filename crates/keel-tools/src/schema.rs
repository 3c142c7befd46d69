//! Structural input contracts.
//!
//! This is deliberately a small subset of JSON Schema: a top-level `type`,
//! `required` property names, and a primitive `type` for each listed
//! property. Anything else in the schema is ignored.

use serde_json::Value;

/// Check `input` against `schema`, returning a human-readable reason on
/// mismatch.
pub fn check_input(schema: &Value, input: &Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, input) {
            return Err(format!("expected {expected}, got {}", type_name(input)));
        }
    }

    let Some(object) = input.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, spec) in properties {
            let (Some(value), Some(expected)) =
                (object.get(field), spec.get("type").and_then(Value::as_str))
            else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "field '{field}' should be {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        // Unknown type names are not enforced.
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
