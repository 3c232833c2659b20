use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::schema::{object_schema, ArgumentValidator, ParamSpec};
use crate::core::errors::{Result, StagehandError};

/// A named, externally performed action with a typed parameter schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    /// Whether performing the operation changes external state
    #[serde(default)]
    pub side_effect: bool,
}

impl Operation {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            side_effect: false,
        }
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn with_side_effect(mut self, side_effect: bool) -> Self {
        self.side_effect = side_effect;
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// JSON Schema describing the accepted arguments
    pub fn input_schema(&self) -> Value {
        object_schema(&self.parameters)
    }
}

#[derive(Debug, Deserialize)]
struct OperationCatalog {
    operations: Vec<Operation>,
}

struct RegisteredOperation {
    operation: Arc<Operation>,
    validator: ArgumentValidator,
}

/// Catalog of every operation the system may perform
///
/// Populated during setup and shared read-only (behind `Arc`) afterwards.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<String, RegisteredOperation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation; names are unique
    pub fn register(&mut self, operation: Operation) -> Result<()> {
        if operation.name.trim().is_empty() {
            return Err(StagehandError::configuration_field(
                "operation name cannot be empty",
                "name",
            ));
        }
        if self.operations.contains_key(&operation.name) {
            return Err(StagehandError::duplicate_operation(&operation.name));
        }
        let validator = ArgumentValidator::compile(&operation.name, &operation.parameters)?;
        debug!(
            operation = %operation.name,
            parameters = operation.parameters.len(),
            "Registered operation"
        );
        self.operations.insert(
            operation.name.clone(),
            RegisteredOperation {
                operation: Arc::new(operation),
                validator,
            },
        );
        Ok(())
    }

    pub fn with_operation(mut self, operation: Operation) -> Result<Self> {
        self.register(operation)?;
        Ok(self)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Operation>> {
        self.operations
            .get(name)
            .map(|r| Arc::clone(&r.operation))
            .ok_or_else(|| StagehandError::unknown_operation(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Validate arguments against the named operation's schema
    pub fn validate_arguments(&self, name: &str, arguments: &Map<String, Value>) -> Result<()> {
        let registered = self
            .operations
            .get(name)
            .ok_or_else(|| StagehandError::unknown_operation(name))?;
        registered.validator.validate(arguments)
    }

    /// Load a catalog of the form `operations: [...]`
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let catalog: OperationCatalog = serde_yaml::from_str(yaml)?;
        let mut registry = Self::new();
        for operation in catalog.operations {
            registry.register(operation)?;
        }
        Ok(registry)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| StagehandError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::schema::ParamType;
    use serde_json::json;

    fn weather() -> Operation {
        Operation::new("weather_lookup", "Current weather for a city")
            .with_param(ParamSpec::required("city", ParamType::String))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = OperationRegistry::new().with_operation(weather()).unwrap();
        let op = registry.lookup("weather_lookup").unwrap();
        assert_eq!(op.parameters.len(), 1);
        assert!(registry.contains("weather_lookup"));
        assert_eq!(registry.names(), vec!["weather_lookup".to_string()]);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = OperationRegistry::new();
        registry.register(weather()).unwrap();
        let err = registry.register(weather()).unwrap_err();
        assert!(matches!(
            err,
            StagehandError::DuplicateOperation { ref name } if name == "weather_lookup"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_lookup() {
        let registry = OperationRegistry::new();
        assert!(matches!(
            registry.lookup("nope"),
            Err(StagehandError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn test_argument_validation_through_registry() {
        let registry = OperationRegistry::new().with_operation(weather()).unwrap();
        let good = json!({"city": "Paris"}).as_object().cloned().unwrap();
        let bad = json!({"city": 12}).as_object().cloned().unwrap();
        assert!(registry.validate_arguments("weather_lookup", &good).is_ok());
        assert!(registry.validate_arguments("weather_lookup", &bad).is_err());
    }

    #[test]
    fn test_yaml_catalog() {
        let yaml = r#"
operations:
  - name: currency_convert
    description: Convert an amount between currencies
    parameters:
      - name: amount
        type: number
        minimum: 0
      - name: to
        type: string
        pattern: "^[A-Z]{3}$"
      - name: rounding
        type: integer
        required: false
  - name: book_table
    side_effect: true
"#;
        let registry = OperationRegistry::from_yaml_str(yaml).unwrap();
        assert_eq!(registry.len(), 2);
        let convert = registry.lookup("currency_convert").unwrap();
        assert!(!convert.param("rounding").unwrap().required);
        assert!(registry.lookup("book_table").unwrap().side_effect);
    }
}
