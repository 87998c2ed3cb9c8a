//! Minimal canonical JSON encoding.
//!
//! - Object keys are sorted lexicographically (via `BTreeMap`); array order
//!   is preserved.
//! - No insignificant whitespace.
//! - Numbers use serde_json's default rendering, which is stable for a
//!   given value. NaN/Inf are not representable in JSON and must not reach
//!   the codec.

use std::collections::BTreeMap;

use serde_json::Value;

/// Render `value` in canonical form: byte-for-byte identical output for
/// logically identical input.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // String escaping of a plain string cannot fail.
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (key, item) in map {
                sorted.insert(key, to_canonical_json(item));
            }
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(key, item)| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(key).unwrap_or_default(),
                        item
                    )
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}
