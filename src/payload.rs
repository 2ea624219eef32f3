use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REDACTED_OUTPUT: &str = "[REDACTED]";

/// Tool input/output value. Maps are ordered by key, so structural equality
/// and fingerprints are independent of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    pub fn text(value: impl Into<String>) -> Self {
        Payload::Text(value.into())
    }

    pub fn redacted() -> Self {
        Payload::Text(REDACTED_OUTPUT.to_string())
    }

    pub fn is_redacted(&self) -> bool {
        matches!(self, Payload::Text(text) if text == REDACTED_OUTPUT)
    }

    /// Canonical JSON rendering used as the dedup key. Map keys serialize in
    /// sorted order, so equal values always produce equal fingerprints.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Payload::Number(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Number(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(flag) => Payload::Bool(flag),
            Value::Number(number) => Payload::Number(number.as_f64().unwrap_or_default()),
            Value::String(text) => Payload::Text(text),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => Payload::Map(
                map.into_iter()
                    .map(|(key, item)| (key, Payload::from(item)))
                    .collect(),
            ),
        }
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Null => Value::Null,
            Payload::Bool(flag) => Value::Bool(flag),
            Payload::Number(number) => serde_json::Number::from_f64(number)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Payload::Text(text) => Value::String(text),
            Payload::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Payload::Map(map) => Value::Object(
                map.into_iter()
                    .map(|(key, item)| (key, Value::from(item)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_equality_should_ignore_key_insertion_order() {
        let first = Payload::from(serde_json::json!({ "a": 1, "b": 2 }));
        let second = Payload::from(serde_json::json!({ "b": 2, "a": 1 }));

        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_should_distinguish_text_from_number() {
        assert_ne!(
            Payload::text("5").fingerprint(),
            Payload::Number(5.0).fingerprint()
        );
    }

    #[test]
    fn fingerprint_should_cover_nested_values() {
        let nested = Payload::from(serde_json::json!({
            "mode": "upper",
            "lines": ["one", "two"],
            "options": { "trim": true, "width": 80 }
        }));
        let reordered = Payload::from(serde_json::json!({
            "options": { "width": 80, "trim": true },
            "lines": ["one", "two"],
            "mode": "upper"
        }));

        assert_eq!(nested.fingerprint(), reordered.fingerprint());
        // List order stays significant.
        let swapped = Payload::from(serde_json::json!({
            "mode": "upper",
            "lines": ["two", "one"],
            "options": { "trim": true, "width": 80 }
        }));
        assert_ne!(nested.fingerprint(), swapped.fingerprint());
    }

    #[test]
    fn payload_should_round_trip_through_json() {
        let payload = Payload::from(serde_json::json!({
            "text": "hello",
            "count": 3,
            "enabled": false,
            "missing": null,
            "parts": [1, "two"]
        }));

        let encoded = serde_json::to_string(&payload).expect("payload should serialize");
        let decoded: Payload = serde_json::from_str(&encoded).expect("payload should deserialize");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn redacted_should_use_the_fixed_placeholder() {
        let redacted = Payload::redacted();
        assert!(redacted.is_redacted());
        assert_eq!(redacted.as_text(), Some(REDACTED_OUTPUT));
        assert!(!Payload::text("visible output").is_redacted());
    }
}
