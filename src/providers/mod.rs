//! Provider adapter implementations.
//!
//! Each adapter normalises one wire protocol behind the
//! [`crate::traits::LLMProvider`] interface and classifies its native
//! failures into the shared error taxonomy.

pub mod anthropic;
pub mod mock;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use mock::MockProvider;
pub use openai::OpenAIProvider;

use serde_json::Value;

/// Depth ceiling for [`safe_dump`].
pub const MAX_DUMP_DEPTH: usize = 10;

/// Bound a raw provider response for logging.
///
/// Values nested deeper than `max_depth` are replaced with a sentinel
/// string, so an adversarially deep (or, through shared references,
/// effectively cyclic) payload can never hang serialisation or explode a
/// log line. Scalars pass through unchanged.
pub fn safe_dump(value: &Value, max_depth: usize) -> Value {
    fn walk(value: &Value, depth: usize, max_depth: usize) -> Value {
        if depth > max_depth {
            return Value::String(format!("<max_depth_exceeded: {}>", type_name(value)));
        }
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), walk(v, depth + 1, max_depth)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| walk(v, depth + 1, max_depth))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    walk(value, 0, max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_dump_passes_shallow_values() {
        let value = json!({"a": 1, "b": [true, "x"], "c": {"d": null}});
        assert_eq!(safe_dump(&value, MAX_DUMP_DEPTH), value);
    }

    #[test]
    fn test_safe_dump_truncates_deep_nesting() {
        let mut value = json!("leaf");
        for _ in 0..20 {
            value = json!({ "next": value });
        }
        let dumped = safe_dump(&value, 3);
        let truncated = &dumped["next"]["next"]["next"];
        assert!(truncated
            .as_str()
            .is_some_and(|s| s.starts_with("<max_depth_exceeded")));
    }

    #[test]
    fn test_safe_dump_truncates_deep_arrays() {
        let value = json!([[[["deep"]]]]);
        let dumped = safe_dump(&value, 2);
        assert!(dumped[0][0]
            .as_str()
            .is_some_and(|s| s.starts_with("<max_depth_exceeded: array")));
    }
}
