//! Parameter binding and validation.
//!
//! Every declared parameter receives a value from the caller's overrides or
//! its default, is checked against its declared constraints, and is rendered
//! to the JSON value a `Ref` to it produces: a string for scalar types, an
//! array of strings for list types.

use std::collections::HashMap;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

use crate::{
    error::TemplateError,
    model::ParameterBinding,
};

/// Placeholder shown instead of `NoEcho` parameter values.
pub const MASKED_VALUE: &str = "****";

/// Bind and validate all parameters.
///
/// Overrides naming an undeclared parameter are rejected, as are parameters
/// that end up with no value at all.
pub fn bind_parameters(
    declared: &IndexMap<String, ParameterBinding>,
    overrides: &HashMap<String, String>,
) -> Result<IndexMap<String, Value>, TemplateError> {
    if let Some(unknown) = overrides.keys().find(|name| !declared.contains_key(*name)) {
        return Err(TemplateError::InvalidParameter {
            parameter: unknown.clone(),
            reason: "parameter is not declared by the template".into(),
        });
    }

    let mut bound = IndexMap::with_capacity(declared.len());
    for (name, binding) in declared {
        let raw = overrides.get(name).or(binding.default.as_ref()).ok_or_else(|| TemplateError::InvalidParameter {
            parameter: name.clone(),
            reason: "no value supplied and no default declared".into(),
        })?;

        let value = validate_parameter_value(binding, raw).map_err(|reason| TemplateError::InvalidParameter {
            parameter: name.clone(),
            reason: match &binding.constraint_description {
                Some(description) => format!("{reason} ({description})"),
                None => reason,
            },
        })?;
        bound.insert(name.clone(), value);
    }
    Ok(bound)
}

/// Validate a raw string against a parameter declaration and render it.
pub fn validate_parameter_value(binding: &ParameterBinding, raw: &str) -> Result<Value, String> {
    if binding.parameter_type.is_list() {
        let items: Vec<String> = if raw.trim().is_empty() {
            Vec::new()
        } else {
            raw.split(',').map(|item| item.trim().to_string()).collect()
        };
        for item in &items {
            validate_scalar(binding, item)?;
        }
        Ok(Value::Array(items.into_iter().map(Value::String).collect()))
    } else {
        validate_scalar(binding, raw)?;
        Ok(Value::String(raw.to_string()))
    }
}

fn validate_scalar(binding: &ParameterBinding, candidate: &str) -> Result<(), String> {
    if !binding.allowed_values.is_empty() && !binding.allowed_values.iter().any(|allowed| allowed == candidate) {
        return Err(format!(
            "value '{}' is not one of the allowed values [{}]",
            display_value(binding, candidate),
            binding.allowed_values.join(", ")
        ));
    }

    if binding.parameter_type.is_numeric() {
        let number = candidate
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("value '{}' is not a number", display_value(binding, candidate)))?;
        if let Some(min_value) = binding.min_value
            && number < min_value
        {
            return Err(format!("value must be at least {min_value}"));
        }
        if let Some(max_value) = binding.max_value
            && number > max_value
        {
            return Err(format!("value must be at most {max_value}"));
        }
        return Ok(());
    }

    let length = candidate.chars().count();
    if let Some(min_length) = binding.min_length
        && length < min_length
    {
        return Err(format!("value must be at least {min_length} characters"));
    }
    if let Some(max_length) = binding.max_length
        && length > max_length
    {
        return Err(format!("value must be at most {max_length} characters"));
    }
    if let Some(pattern) = &binding.allowed_pattern {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|error| format!("invalid pattern '{pattern}': {error}"))?;
        if !regex.is_match(candidate) {
            return Err(format!("value must match the pattern {pattern}"));
        }
    }
    Ok(())
}

fn display_value<'a>(binding: &ParameterBinding, candidate: &'a str) -> &'a str {
    if binding.no_echo { MASKED_VALUE } else { candidate }
}

/// Render bound parameters for display, masking `NoEcho` values.
pub fn masked_parameters(declared: &IndexMap<String, ParameterBinding>, bound: &IndexMap<String, Value>) -> IndexMap<String, Value> {
    bound
        .iter()
        .map(|(name, value)| {
            let masked = declared.get(name).is_some_and(|binding| binding.no_echo);
            let shown = if masked { Value::String(MASKED_VALUE.into()) } else { value.clone() };
            (name.clone(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParameterType;

    fn binding(name: &str, parameter_type: ParameterType) -> ParameterBinding {
        ParameterBinding {
            name: name.into(),
            parameter_type,
            description: None,
            default: None,
            allowed_values: Vec::new(),
            allowed_pattern: None,
            constraint_description: None,
            min_length: None,
            max_length: None,
            min_value: None,
            max_value: None,
            no_echo: false,
        }
    }

    fn declared(bindings: Vec<ParameterBinding>) -> IndexMap<String, ParameterBinding> {
        bindings.into_iter().map(|binding| (binding.name.clone(), binding)).collect()
    }

    #[test]
    fn overrides_take_precedence_over_defaults() {
        let mut instance_type = binding("InstanceType", ParameterType::String);
        instance_type.default = Some("t3.micro".into());
        instance_type.allowed_values = vec!["t3.micro".into(), "t3.small".into()];
        let declared = declared(vec![instance_type]);

        let bound = bind_parameters(&declared, &HashMap::new()).unwrap();
        assert_eq!(bound["InstanceType"], Value::String("t3.micro".into()));

        let overrides = HashMap::from([("InstanceType".to_string(), "t3.small".to_string())]);
        let bound = bind_parameters(&declared, &overrides).unwrap();
        assert_eq!(bound["InstanceType"], Value::String("t3.small".into()));
    }

    #[test]
    fn rejects_values_outside_allowed_set() {
        let mut instance_type = binding("InstanceType", ParameterType::String);
        instance_type.allowed_values = vec!["t3.micro".into()];
        let overrides = HashMap::from([("InstanceType".to_string(), "m5.24xlarge".to_string())]);
        let error = bind_parameters(&declared(vec![instance_type]), &overrides).unwrap_err();
        assert!(matches!(error, TemplateError::InvalidParameter { ref parameter, .. } if parameter == "InstanceType"));
    }

    #[test]
    fn rejects_missing_values_and_unknown_overrides() {
        let key_name = binding("KeyName", ParameterType::ProviderScalar("AWS::EC2::KeyPair::KeyName".into()));
        let declared = declared(vec![key_name]);
        let error = bind_parameters(&declared, &HashMap::new()).unwrap_err();
        assert!(error.to_string().contains("no value supplied"));

        let overrides = HashMap::from([
            ("KeyName".to_string(), "ops".to_string()),
            ("Bogus".to_string(), "x".to_string()),
        ]);
        let error = bind_parameters(&declared, &overrides).unwrap_err();
        assert!(error.to_string().contains("Bogus"));
    }

    #[test]
    fn enforces_numeric_bounds() {
        let mut count = binding("Count", ParameterType::Number);
        count.min_value = Some(1.0);
        count.max_value = Some(3.0);
        assert!(validate_parameter_value(&count, "2").is_ok());
        assert!(validate_parameter_value(&count, "0").is_err());
        assert!(validate_parameter_value(&count, "4").is_err());
        assert!(validate_parameter_value(&count, "two").is_err());
    }

    #[test]
    fn enforces_pattern_and_length_with_full_match() {
        let mut cidr = binding("VpcCidr", ParameterType::String);
        cidr.allowed_pattern = Some(r"(\d{1,3}\.){3}\d{1,3}/\d{1,2}".into());
        cidr.max_length = Some(18);
        assert!(validate_parameter_value(&cidr, "10.0.0.0/16").is_ok());
        assert!(validate_parameter_value(&cidr, "x10.0.0.0/16").is_err());
        assert!(validate_parameter_value(&cidr, "100.100.100.100/32x").is_err());
    }

    #[test]
    fn list_parameters_render_as_arrays() {
        let ports = binding("Ports", ParameterType::NumberList);
        let value = validate_parameter_value(&ports, "80, 443").unwrap();
        assert_eq!(value, serde_json::json!(["80", "443"]));
        assert!(validate_parameter_value(&ports, "80,https").is_err());
    }

    #[test]
    fn no_echo_values_are_masked() {
        let mut secret = binding("DbPassword", ParameterType::String);
        secret.no_echo = true;
        secret.allowed_values = vec!["letmein".into()];
        let error = validate_parameter_value(&secret, "hunter2").unwrap_err();
        assert!(!error.contains("hunter2"));

        let declared = declared(vec![secret]);
        let bound = IndexMap::from([("DbPassword".to_string(), Value::String("letmein".into()))]);
        assert_eq!(masked_parameters(&declared, &bound)["DbPassword"], Value::String(MASKED_VALUE.into()));
    }
}
