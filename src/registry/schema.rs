//! Config schemas for node kinds.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON shape a config field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    String,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl ConfigType {
    fn matches(self, value: &Value) -> bool {
        match self {
            ConfigType::String => value.is_string(),
            ConfigType::Integer => value.is_i64() || value.is_u64(),
            ConfigType::Boolean => value.is_boolean(),
            ConfigType::Array => value.is_array(),
            ConfigType::Object => value.is_object(),
            ConfigType::Any => true,
        }
    }
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigType::String => "string",
            ConfigType::Integer => "integer",
            ConfigType::Boolean => "boolean",
            ConfigType::Array => "array",
            ConfigType::Object => "object",
            ConfigType::Any => "any",
        };
        f.write_str(s)
    }
}

/// One accepted config key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: ConfigType,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Accepted config keys of a node kind. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field
    pub fn required(mut self, name: &str, field_type: ConfigType, description: &str) -> Self {
        self.fields.push(ConfigField {
            name: name.to_string(),
            field_type,
            required: true,
            description: description.to_string(),
        });
        self
    }

    /// Add an optional field
    pub fn optional(mut self, name: &str, field_type: ConfigType, description: &str) -> Self {
        self.fields.push(ConfigField {
            name: name.to_string(),
            field_type,
            required: false,
            description: description.to_string(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&ConfigField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check a node's config, returning every problem found
    pub fn check(&self, config: &BTreeMap<String, Value>) -> Vec<String> {
        let mut problems = Vec::new();

        for field in &self.fields {
            match config.get(&field.name) {
                None if field.required => {
                    problems.push(format!("missing required key '{}'", field.name));
                }
                Some(value) if !field.field_type.matches(value) => {
                    problems.push(format!(
                        "key '{}' must be {}, got {}",
                        field.name,
                        field.field_type,
                        json_kind(value)
                    ));
                }
                _ => {}
            }
        }

        for key in config.keys() {
            if self.field(key).is_none() {
                problems.push(format!("unknown key '{}'", key));
            }
        }

        problems
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
