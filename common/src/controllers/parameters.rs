use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::AppError, storage::types::job::ResourceOptions};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Int,
    Float,
    Str,
    Bool,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::Str => "str",
            ParameterType::Bool => "bool",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParameterType::Int => value.is_i64() || value.is_u64(),
            ParameterType::Float => value.is_f64(),
            ParameterType::Str => value.is_string(),
            ParameterType::Bool => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParameterValidation {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParameterType>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// One globally recognised resource option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSpec {
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub variable_name: String,
    #[serde(default)]
    pub validation: ParameterValidation,
}

/// Checks requested resource options against the global parameter list.
#[derive(Debug, Clone, Default)]
pub struct ParameterValidator {
    parameters: Vec<ParameterSpec>,
}

impl ParameterValidator {
    pub fn new(parameters: Vec<ParameterSpec>) -> Self {
        Self { parameters }
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn get(&self, variable_name: &str) -> Option<&ParameterSpec> {
        self.parameters
            .iter()
            .find(|p| p.variable_name == variable_name)
    }

    /// Returns the recognised subset of `options`, or every problem found.
    pub fn validate(&self, options: &ResourceOptions) -> Result<ResourceOptions, AppError> {
        let mut errors = Vec::new();

        for param in &self.parameters {
            if param.validation.required && !options.contains_key(&param.variable_name) {
                errors.push(format!("Missing required: {}", param.variable_name));
            }
        }

        let mut accepted = ResourceOptions::new();
        for (name, value) in options {
            let Some(param) = self.get(name) else {
                continue;
            };
            check_value(name, value, &param.validation, &mut errors);
            accepted.insert(name.clone(), value.clone());
        }

        if errors.is_empty() {
            Ok(accepted)
        } else {
            Err(AppError::InvalidOptions(errors))
        }
    }
}

fn check_value(name: &str, value: &Value, rules: &ParameterValidation, errors: &mut Vec<String>) {
    let shown = display_value(value);

    if let Some(kind) = rules.kind {
        if !kind.matches(value) {
            errors.push(format!(
                "{name}: Value '{shown}' of type {} does not match required type {}. \
                 Skipping further validation of parameter {name}.",
                value_type_name(value),
                kind.as_str()
            ));
            return;
        }
    }

    let Some(number) = value.as_f64() else {
        return;
    };
    if let Some(min) = rules.min {
        if number <= min {
            errors.push(format!("{name}: Value '{shown}' not above minimum of {min}."));
        }
    }
    if let Some(max) = rules.max {
        if number >= max {
            errors.push(format!("{name}: Value '{shown}' above maximum of {max}."));
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Validation plus renaming of options into a backend's vocabulary.
///
/// Backends embed one of these and forward the `ResourceController`
/// option hooks to it, overriding only what differs.
#[derive(Debug, Clone, Default)]
pub struct OptionTranslator {
    validator: std::sync::Arc<ParameterValidator>,
    mapping: HashMap<String, String>,
}

impl OptionTranslator {
    pub fn new(validator: std::sync::Arc<ParameterValidator>, mapping: HashMap<String, String>) -> Self {
        Self { validator, mapping }
    }

    pub fn validate(&self, options: &ResourceOptions) -> Result<ResourceOptions, AppError> {
        self.validator.validate(options)
    }

    /// Renames recognised options through the mapping table and drops the rest.
    pub fn translate(&self, options: &ResourceOptions) -> ResourceOptions {
        options
            .iter()
            .filter(|(name, _)| self.validator.get(name).is_some())
            .map(|(name, value)| {
                let target = self.mapping.get(name).unwrap_or(name);
                (target.clone(), value.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    fn spec(name: &str, kind: ParameterType, required: bool, min: Option<f64>, max: Option<f64>) -> ParameterSpec {
        ParameterSpec {
            display_name: name.to_uppercase(),
            description: String::new(),
            variable_name: name.to_string(),
            validation: ParameterValidation {
                kind: Some(kind),
                required,
                min,
                max,
            },
        }
    }

    fn validator() -> ParameterValidator {
        ParameterValidator::new(vec![
            spec("num_cpus", ParameterType::Int, true, Some(1.0), Some(16.0)),
            spec("memory_mb", ParameterType::Int, false, Some(1024.0), None),
            spec("gpu_enabled", ParameterType::Bool, false, None, None),
        ])
    }

    fn options(value: serde_json::Value) -> ResourceOptions {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn unknown_keys_are_dropped_not_rejected() {
        let validated = validator()
            .validate(&options(json!({"num_cpus": 2, "colour": "blue"})))
            .expect("valid options");
        assert_eq!(validated, options(json!({"num_cpus": 2})));
    }

    #[test]
    fn reports_every_problem_with_source_wording() {
        let err = validator()
            .validate(&options(json!({"memory_mb": 10, "gpu_enabled": "yes"})))
            .expect_err("invalid options");
        let AppError::InvalidOptions(errors) = err else {
            panic!("expected invalid options error");
        };
        assert!(errors.contains(&"Missing required: num_cpus".to_string()));
        assert!(errors.contains(&"memory_mb: Value '10' not above minimum of 1024.".to_string()));
        assert!(errors.contains(
            &"gpu_enabled: Value 'yes' of type str does not match required type bool. \
              Skipping further validation of parameter gpu_enabled."
                .to_string()
        ));
    }

    #[test]
    fn bounds_are_exclusive() {
        let v = validator();
        assert!(v.validate(&options(json!({"num_cpus": 2}))).is_ok());
        assert!(v.validate(&options(json!({"num_cpus": 15}))).is_ok());

        let err = v
            .validate(&options(json!({"num_cpus": 1})))
            .expect_err("at min");
        assert!(matches!(
            err,
            AppError::InvalidOptions(ref e) if e == &vec!["num_cpus: Value '1' not above minimum of 1.".to_string()]
        ));
        let err = v
            .validate(&options(json!({"num_cpus": 16})))
            .expect_err("at max");
        assert!(matches!(
            err,
            AppError::InvalidOptions(ref e) if e == &vec!["num_cpus: Value '16' above maximum of 16.".to_string()]
        ));
    }

    #[test]
    fn translate_after_validate_preserves_recognised_values() {
        let translator = OptionTranslator::new(Arc::new(validator()), HashMap::new());
        let input = options(json!({"num_cpus": 4, "gpu_enabled": true, "extra": [1, 2]}));

        let validated = translator.validate(&input).expect("valid");
        let translated = translator.translate(&validated);

        assert_eq!(translated, options(json!({"num_cpus": 4, "gpu_enabled": true})));
    }

    #[test]
    fn translate_renames_through_mapping() {
        let mapping = HashMap::from([("num_cpus".to_string(), "cpus_per_task".to_string())]);
        let translator = OptionTranslator::new(Arc::new(validator()), mapping);

        let translated = translator.translate(&options(json!({"num_cpus": 4, "memory_mb": 2048})));

        assert_eq!(
            translated,
            options(json!({"cpus_per_task": 4, "memory_mb": 2048}))
        );
    }
}
