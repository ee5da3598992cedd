//! Input/output schema validation.
//!
//! [`BuiltinValidator`] understands the JSON-schema subset hosts actually
//! send: `type` (single or list), `enum`, `const`, `anyOf`/`oneOf`/`allOf`,
//! numeric bounds, string length/`pattern`/`format`, array item rules and
//! object `properties`/`required`/`additionalProperties`. Hosts with other
//! needs plug in their own [`SchemaValidator`].

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use serde_json::Value;

use crate::error::{SandboxError, SchemaStage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub fn into_sandbox(self, stage: SchemaStage) -> SandboxError {
        SandboxError::SchemaValidation {
            stage,
            path: self.path,
            message: self.message,
        }
    }
}

pub trait SchemaValidator: Send + Sync {
    fn validate(&self, value: &Value, schema: &Value) -> Result<(), SchemaError>;
}

const EMAIL: &str = r"^[^@]+@[^@]+\.[^@]+$";
const UUID: &str =
    r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";

/// Built-in validator. Compiled patterns are cached per instance.
#[derive(Debug, Default)]
pub struct BuiltinValidator {
    patterns: Mutex<HashMap<String, Regex>>,
}

impl BuiltinValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self, pattern: &str, text: &str, path: &str) -> Result<bool, SchemaError> {
        let mut cache = self
            .patterns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(re) = cache.get(pattern) {
            return Ok(re.is_match(text));
        }
        let re = Regex::new(pattern).map_err(|_| SchemaError::new(path, "invalid pattern"))?;
        let hit = re.is_match(text);
        cache.insert(pattern.to_string(), re);
        Ok(hit)
    }

    fn check(&self, value: &Value, schema: &Value, path: &str) -> Result<(), SchemaError> {
        let rules = match schema {
            Value::Null | Value::Bool(true) => return Ok(()),
            Value::Bool(false) => return Err(SchemaError::new(path, "schema rejects every value")),
            Value::Object(rules) => rules,
            _ => return Err(SchemaError::new(path, "invalid schema")),
        };

        if let Some(subs) = rules.get("anyOf").and_then(Value::as_array) {
            let mut last = None;
            let mut matched = false;
            for sub in subs {
                match self.check(value, sub, path) {
                    Ok(()) => {
                        matched = true;
                        break;
                    }
                    Err(e) => last = Some(e),
                }
            }
            if !matched {
                return Err(last.unwrap_or_else(|| SchemaError::new(path, "anyOf failed")));
            }
        }
        if let Some(subs) = rules.get("oneOf").and_then(Value::as_array) {
            let hits = subs
                .iter()
                .filter(|sub| self.check(value, sub, path).is_ok())
                .count();
            if hits != 1 {
                return Err(SchemaError::new(path, "oneOf failed"));
            }
        }
        if let Some(subs) = rules.get("allOf").and_then(Value::as_array) {
            for sub in subs {
                self.check(value, sub, path)?;
            }
        }
        if let Some(options) = rules.get("enum").and_then(Value::as_array) {
            if !options.iter().any(|o| json_eq(o, value)) {
                return Err(SchemaError::new(path, "value not in enum"));
            }
        }
        if let Some(expected) = rules.get("const") {
            if !json_eq(expected, value) {
                return Err(SchemaError::new(path, "value does not match const"));
            }
        }

        match rules.get("type") {
            None => Ok(()),
            Some(Value::String(t)) => self.check_type(value, t, rules, path),
            Some(Value::Array(types)) => {
                let mut last = None;
                for t in types.iter().filter_map(Value::as_str) {
                    match self.check_type(value, t, rules, path) {
                        Ok(()) => return Ok(()),
                        Err(e) => last = Some(e),
                    }
                }
                Err(last.unwrap_or_else(|| SchemaError::new(path, "type mismatch")))
            }
            Some(_) => Err(SchemaError::new(path, "invalid schema")),
        }
    }

    fn check_type(
        &self,
        value: &Value,
        t: &str,
        rules: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaError> {
        match (t, value) {
            ("null", Value::Null) | ("boolean", Value::Bool(_)) => Ok(()),
            ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => check_number(n, rules, path),
            ("number", Value::Number(n)) => check_number(n, rules, path),
            ("string", Value::String(s)) => self.check_string(s, rules, path),
            ("array", Value::Array(items)) => self.check_array(items, rules, path),
            ("object", Value::Object(map)) => self.check_object(map, rules, path),
            ("null" | "boolean" | "integer" | "number" | "string" | "array" | "object", _) => {
                Err(SchemaError::new(path, format!("expected {t}")))
            }
            _ => Err(SchemaError::new(path, format!("unknown type '{t}'"))),
        }
    }

    fn check_string(
        &self,
        s: &str,
        rules: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaError> {
        let len = s.chars().count() as u64;
        if rules.get("minLength").and_then(Value::as_u64).is_some_and(|min| len < min) {
            return Err(SchemaError::new(path, "too short"));
        }
        if rules.get("maxLength").and_then(Value::as_u64).is_some_and(|max| len > max) {
            return Err(SchemaError::new(path, "too long"));
        }
        if let Some(pattern) = rules.get("pattern").and_then(Value::as_str) {
            if !self.matches(pattern, s, path)? {
                return Err(SchemaError::new(path, "pattern mismatch"));
            }
        }
        let Some(format) = rules.get("format").and_then(Value::as_str) else {
            return Ok(());
        };
        let valid = match format {
            "email" => self.matches(EMAIL, s, path)?,
            "uuid" => self.matches(UUID, s, path)?,
            "date-time" => chrono::DateTime::parse_from_rfc3339(s).is_ok(),
            "date" => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            _ => true,
        };
        if valid {
            Ok(())
        } else {
            Err(SchemaError::new(path, format!("invalid {format}")))
        }
    }

    fn check_array(
        &self,
        items: &[Value],
        rules: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaError> {
        let len = items.len() as u64;
        if rules.get("minItems").and_then(Value::as_u64).is_some_and(|min| len < min) {
            return Err(SchemaError::new(path, "too few items"));
        }
        if rules.get("maxItems").and_then(Value::as_u64).is_some_and(|max| len > max) {
            return Err(SchemaError::new(path, "too many items"));
        }
        if let Some(item_schema) = rules.get("items") {
            for (i, item) in items.iter().enumerate() {
                self.check(item, item_schema, &format!("{path}[{i}]"))?;
            }
        }
        Ok(())
    }

    fn check_object(
        &self,
        map: &serde_json::Map<String, Value>,
        rules: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaError> {
        let empty = serde_json::Map::new();
        let props = rules
            .get("properties")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        if let Some(required) = rules.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(key) {
                    return Err(SchemaError::new(&format!("{path}.{key}"), "missing required"));
                }
            }
        }
        let additional = rules.get("additionalProperties");
        for (key, value) in map {
            let child = format!("{path}.{key}");
            match (props.get(key), additional) {
                (Some(sub), _) => self.check(value, sub, &child)?,
                (None, Some(Value::Bool(false))) => {
                    return Err(SchemaError::new(&child, "unexpected property"))
                }
                (None, Some(sub @ Value::Object(_))) => self.check(value, sub, &child)?,
                (None, _) => {}
            }
        }
        Ok(())
    }
}

impl SchemaValidator for BuiltinValidator {
    fn validate(&self, value: &Value, schema: &Value) -> Result<(), SchemaError> {
        self.check(value, schema, "$")
    }
}

fn check_number(
    n: &serde_json::Number,
    rules: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<(), SchemaError> {
    let Some(v) = n.as_f64() else {
        return Ok(());
    };
    let bound = |key: &str| rules.get(key).and_then(Value::as_f64);
    if bound("minimum").is_some_and(|min| v < min) {
        return Err(SchemaError::new(path, "below minimum"));
    }
    if bound("maximum").is_some_and(|max| v > max) {
        return Err(SchemaError::new(path, "above maximum"));
    }
    if bound("exclusiveMinimum").is_some_and(|min| v <= min) {
        return Err(SchemaError::new(path, "not above exclusiveMinimum"));
    }
    if bound("exclusiveMaximum").is_some_and(|max| v >= max) {
        return Err(SchemaError::new(path, "not below exclusiveMaximum"));
    }
    Ok(())
}

/// Equality that treats `1` and `1.0` as the same number.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(value: Value, schema: Value) -> Result<(), SchemaError> {
        BuiltinValidator::new().validate(&value, &schema)
    }

    #[test]
    fn test_object_rules() {
        let schema = json!({
            "type": "object",
            "properties": {"n": {"type": "integer", "minimum": 0}},
            "required": ["n"],
            "additionalProperties": false
        });
        check(json!({"n": 3}), schema.clone()).unwrap();
        assert_eq!(
            check(json!({}), schema.clone()).unwrap_err(),
            SchemaError::new("$.n", "missing required")
        );
        assert_eq!(
            check(json!({"n": -1}), schema.clone()).unwrap_err().message,
            "below minimum"
        );
        assert_eq!(
            check(json!({"n": 1, "x": 2}), schema).unwrap_err().path,
            "$.x"
        );
    }

    #[test]
    fn test_integer_excludes_floats() {
        assert!(check(json!(1.5), json!({"type": "integer"})).is_err());
        check(json!(1.5), json!({"type": "number"})).unwrap();
        check(json!(null), json!({"type": ["string", "null"]})).unwrap();
    }

    #[test]
    fn test_array_item_paths() {
        let schema = json!({"type": "array", "items": {"type": "string"}, "maxItems": 3});
        let err = check(json!(["a", 2]), schema.clone()).unwrap_err();
        assert_eq!(err.path, "$[1]");
        assert_eq!(err.message, "expected string");
        assert_eq!(check(json!(["a", "b", "c", "d"]), schema).unwrap_err().message, "too many items");
    }

    #[test]
    fn test_string_pattern_and_formats() {
        check(json!("abc-123"), json!({"type": "string", "pattern": "^[a-z]+-\\d+$"})).unwrap();
        assert_eq!(
            check(json!("x"), json!({"type": "string", "pattern": "("})).unwrap_err().message,
            "invalid pattern"
        );
        check(json!("dev@example.org"), json!({"format": "email", "type": "string"})).unwrap();
        assert!(check(json!("not-a-uuid"), json!({"type": "string", "format": "uuid"})).is_err());
        check(json!("2024-02-29T10:00:00Z"), json!({"type": "string", "format": "date-time"})).unwrap();
    }

    #[test]
    fn test_combinators() {
        let schema = json!({"oneOf": [{"type": "integer"}, {"type": "number"}]});
        assert!(check(json!(1), schema.clone()).is_err());
        check(json!(1.5), schema).unwrap();
        check(json!("b"), json!({"enum": ["a", "b"]})).unwrap();
        check(json!(2.0), json!({"enum": [2]})).unwrap();
        check(json!(5), json!({"anyOf": [{"type": "string"}, {"minimum": 3}]})).unwrap();
    }

    #[test]
    fn test_schema_error_maps_to_sandbox_error() {
        let err = SchemaError::new("$.n", "missing required").into_sandbox(SchemaStage::Input);
        match err {
            SandboxError::SchemaValidation { stage, path, .. } => {
                assert_eq!(stage, SchemaStage::Input);
                assert_eq!(path, "$.n");
            }
            other => panic!("expected SchemaValidation, got {other:?}"),
        }
    }
}
