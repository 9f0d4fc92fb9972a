//! Declarative config schemas shared by plugin and connector definitions.
//!
//! A definition describes its instance configuration as a flat list of typed
//! fields with optional defaults. Validation happens at create/update time;
//! an invalid config never produces a running instance.

use serde_json::Value;

/// The JSON kind a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }
}

/// One field descriptor.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
}

/// A flat config schema.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    fields: Vec<FieldSpec>,
}

/// Config validation failures.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Config must be a JSON object")]
    NotAnObject,

    #[error("Missing required config field '{0}'")]
    MissingField(String),

    #[error("Config field '{field}' must be a {expected}")]
    WrongKind { field: String, expected: &'static str },

    #[error("Unknown config field '{0}'")]
    UnknownField(String),
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    pub fn required(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: true,
            default: None,
        });
        self
    }

    /// Adds an optional field with a default filled in when absent.
    pub fn optional(mut self, name: &'static str, kind: FieldKind, default: Value) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: false,
            default: Some(default),
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Validates a config and returns a copy with defaults filled.
    ///
    /// `null` is treated as the empty object so definitions with all-default
    /// schemas need no explicit config. Unknown keys are rejected: a typo'd
    /// field name should fail loudly at create time, not be ignored.
    pub fn validate_and_fill(&self, config: &Value) -> Result<Value, SchemaError> {
        let map = match config {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err(SchemaError::NotAnObject),
        };

        for key in map.keys() {
            if !self.fields.iter().any(|f| f.name == key) {
                return Err(SchemaError::UnknownField(key.clone()));
            }
        }

        let mut filled = map;
        for field in &self.fields {
            match filled.get(field.name) {
                Some(value) => {
                    if !field.kind.matches(value) {
                        return Err(SchemaError::WrongKind {
                            field: field.name.to_string(),
                            expected: field.kind.name(),
                        });
                    }
                }
                None => {
                    if let Some(default) = &field.default {
                        filled.insert(field.name.to_string(), default.clone());
                    } else if field.required {
                        return Err(SchemaError::MissingField(field.name.to_string()));
                    }
                }
            }
        }
        Ok(Value::Object(filled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        ConfigSchema::new()
            .required("webhook_url", FieldKind::String)
            .optional("interval_seconds", FieldKind::Integer, json!(60))
            .optional("enabled", FieldKind::Boolean, json!(true))
    }

    #[test]
    fn defaults_fill_absent_optionals() {
        let filled = schema()
            .validate_and_fill(&json!({"webhook_url": "https://example.test/hook"}))
            .unwrap();
        assert_eq!(filled["interval_seconds"], 60);
        assert_eq!(filled["enabled"], true);
    }

    #[test]
    fn missing_required_field_fails() {
        let err = schema().validate_and_fill(&json!({})).unwrap_err();
        assert!(matches!(err, SchemaError::MissingField(f) if f == "webhook_url"));
    }

    #[test]
    fn wrong_kind_fails() {
        let err = schema()
            .validate_and_fill(&json!({"webhook_url": 5}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::WrongKind { .. }));
    }

    #[test]
    fn unknown_field_fails_loudly() {
        let err = schema()
            .validate_and_fill(&json!({"webhook_url": "x", "intervall": 5}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField(f) if f == "intervall"));
    }

    #[test]
    fn null_config_means_all_defaults() {
        let filled = ConfigSchema::new()
            .optional("limit", FieldKind::Integer, json!(10))
            .validate_and_fill(&Value::Null)
            .unwrap();
        assert_eq!(filled["limit"], 10);
    }
}
