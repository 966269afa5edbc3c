//! Best-effort JSON recovery from model output.

use serde_json::{json, Value};

/// Turn summarizer output into a JSON object. Never fails.
///
/// 1. The whole text as a JSON object
/// 2. The outermost `{ ... }` span as a JSON object
/// 3. `{"raw": <trimmed text>}`
pub fn extract_json(text: &str) -> Value {
    if text.is_empty() {
        return json!({ "raw": "" });
    }

    if let Some(value) = parse_object(text) {
        return value;
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Some(value) = parse_object(&text[start..=end]) {
                return value;
            }
        }
    }

    json!({ "raw": text.trim() })
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text).ok().filter(Value::is_object)
}
