//! Typed parameter schemas for operations
//!
//! Parameters are declared with a semantic type and compiled once into a
//! JSON Schema; arguments are checked against it at the executor boundary.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::errors::{Result, StagehandError};

/// Date format accepted by `ParamType::Date`
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Semantic type of an operation parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    /// Calendar date as `YYYY-MM-DD`
    Date,
}

impl ParamType {
    fn json_type(&self) -> &'static str {
        match self {
            ParamType::String | ParamType::Date => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }
}

/// One declared parameter of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Regex the value must match (strings only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Inclusive lower bound (numbers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
}

fn default_required() -> bool {
    true
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: None,
            pattern: None,
            minimum: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    fn to_json_schema(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.param_type.json_type()));
        if let Some(description) = &self.description {
            schema.insert("description".into(), json!(description));
        }
        match self.param_type {
            ParamType::Date => {
                schema.insert("pattern".into(), json!(r"^\d{4}-\d{2}-\d{2}$"));
            }
            _ => {
                if let Some(pattern) = &self.pattern {
                    schema.insert("pattern".into(), json!(pattern));
                }
            }
        }
        if let Some(minimum) = self.minimum {
            schema.insert("minimum".into(), json!(minimum));
        }
        Value::Object(schema)
    }
}

/// Build the JSON Schema for an ordered parameter list
pub fn object_schema(params: &[ParamSpec]) -> Value {
    let properties: Map<String, Value> = params
        .iter()
        .map(|p| (p.name.clone(), p.to_json_schema()))
        .collect();
    let required: Vec<&str> = params
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

/// Compiled argument validator for one operation
pub struct ArgumentValidator {
    operation: String,
    params: Vec<ParamSpec>,
    compiled: jsonschema::Validator,
}

impl ArgumentValidator {
    pub fn compile(operation: &str, params: &[ParamSpec]) -> Result<Self> {
        let schema = object_schema(params);
        let compiled = jsonschema::validator_for(&schema).map_err(|e| {
            StagehandError::configuration_field(
                format!("schema for operation '{}' does not compile: {}", operation, e),
                operation,
            )
        })?;
        Ok(Self {
            operation: operation.to_string(),
            params: params.to_vec(),
            compiled,
        })
    }

    /// Check arguments, reporting every violation at once
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<()> {
        let mut violations = Vec::new();

        for param in self.params.iter().filter(|p| p.required) {
            match arguments.get(&param.name) {
                None | Some(Value::Null) => {
                    violations.push(format!("missing required parameter '{}'", param.name))
                }
                _ => {}
            }
        }

        let instance = Value::Object(arguments.clone());
        for error in self.compiled.iter_errors(&instance) {
            let message = error.to_string();
            // required-ness was already reported with the parameter name
            if !message.contains("is a required property") {
                violations.push(message);
            }
        }

        for param in self.params.iter().filter(|p| p.param_type == ParamType::Date) {
            if let Some(Value::String(raw)) = arguments.get(&param.name) {
                if NaiveDate::parse_from_str(raw, DATE_FORMAT).is_err() {
                    violations.push(format!("'{}' is not a valid date: {}", param.name, raw));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            violations.dedup();
            Err(StagehandError::argument_validation(&self.operation, violations))
        }
    }
}
