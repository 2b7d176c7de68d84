use crate::{Payload, EVENT_ID_LEN};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Renders a value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    canonicalize_value(value.clone()).to_string()
}

pub fn event_content_id(
    timestamp: DateTime<Utc>,
    label: &str,
    event_type: &str,
    payload: Option<&Payload>,
) -> String {
    let mut fields = Map::new();
    fields.insert(
        "timestamp".to_string(),
        Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    fields.insert("label".to_string(), Value::String(label.to_string()));
    fields.insert(
        "event_type".to_string(),
        Value::String(event_type.to_string()),
    );
    fields.insert(
        "payload".to_string(),
        payload.cloned().map(Value::Object).unwrap_or(Value::Null),
    );
    let mut id = sha256_hex(canonical_json(&Value::Object(fields)).as_bytes());
    id.truncate(EVENT_ID_LEN);
    id
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        other => other,
    }
}
