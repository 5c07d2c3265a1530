//! Template parser: raw document text to [`ParsedTemplate`].
//!
//! The document is read as YAML (which also accepts JSON), short-form
//! intrinsic tags are expanded, and each section is deserialized entry by
//! entry so structural errors name the offending node.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use strata_types::{OutputDefinition, ParameterDefinition, ResourceDefinition};
use tracing::debug;

use crate::{
    catalog,
    error::TemplateError,
    model::{OutputNode, ParameterBinding, ParameterType, ParsedTemplate, ResourceNode},
};

pub mod tags;

const KNOWN_SECTIONS: &[&str] = &["AWSTemplateFormatVersion", "Description", "Metadata", "Parameters", "Resources", "Outputs"];

static LOGICAL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]+$").expect("logical id pattern compiles"));

/// Parse template text into a [`ParsedTemplate`].
///
/// Fails with `MalformedTemplate` on syntax or structural errors and with
/// `UnknownResourceType` when a resource type is not in the catalog.
pub fn parse_template(text: &str) -> Result<ParsedTemplate, TemplateError> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|error| TemplateError::malformed(format!("could not parse document: {error}")))?;
    let document = match tags::yaml_to_json(yaml)? {
        Value::Object(map) => map,
        Value::Null => return Err(TemplateError::malformed("document is empty")),
        _ => return Err(TemplateError::malformed("document root must be a mapping")),
    };

    for key in document.keys() {
        if !KNOWN_SECTIONS.contains(&key.as_str()) {
            return Err(TemplateError::malformed(format!("unsupported top-level section '{key}'")));
        }
    }

    let description = match document.get("Description") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(_) => return Err(TemplateError::malformed("'Description' must be a string")),
    };

    let parameters = parse_section::<ParameterDefinition>(&document, "Parameters")?
        .into_iter()
        .map(|(name, definition)| parameter_binding(name.clone(), definition).map(|binding| (name, binding)))
        .collect::<Result<IndexMap<_, _>, _>>()?;

    let resource_definitions = parse_section::<ResourceDefinition>(&document, "Resources")?;
    if resource_definitions.is_empty() {
        return Err(TemplateError::malformed("template must declare at least one resource under 'Resources'"));
    }

    let mut resources = IndexMap::with_capacity(resource_definitions.len());
    for (index, (logical_id, definition)) in resource_definitions.into_iter().enumerate() {
        if parameters.contains_key(&logical_id) {
            return Err(TemplateError::malformed(format!("'{logical_id}' is declared both as a parameter and as a resource")));
        }
        let node = resource_node(logical_id.clone(), index, definition)?;
        resources.insert(logical_id, node);
    }

    let outputs = parse_section::<OutputDefinition>(&document, "Outputs")?
        .into_iter()
        .map(|(name, definition)| {
            let node = OutputNode {
                name: name.clone(),
                description: definition.description,
                value: definition.value,
                export_name: definition.export.map(|export| export.name),
            };
            (name, node)
        })
        .collect();

    debug!(
        parameters = parameters.len(),
        resources = resources.len(),
        "parsed template"
    );

    Ok(ParsedTemplate {
        description,
        parameters,
        resources,
        outputs,
    })
}

fn parse_section<T: DeserializeOwned>(document: &Map<String, Value>, section: &str) -> Result<IndexMap<String, T>, TemplateError> {
    let entries = match document.get(section) {
        None | Some(Value::Null) => return Ok(IndexMap::new()),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(TemplateError::malformed(format!("'{section}' must be a mapping"))),
    };

    let mut parsed = IndexMap::with_capacity(entries.len());
    for (name, raw) in entries {
        if !LOGICAL_ID.is_match(name) {
            return Err(TemplateError::malformed(format!(
                "{section} entry '{name}' must have an alphanumeric name"
            )));
        }
        let entry = serde_json::from_value::<T>(raw.clone())
            .map_err(|error| TemplateError::malformed(format!("{section} entry '{name}': {error}")))?;
        parsed.insert(name.clone(), entry);
    }
    Ok(parsed)
}

fn resource_node(logical_id: String, declaration_index: usize, definition: ResourceDefinition) -> Result<ResourceNode, TemplateError> {
    let resource_type = definition
        .resource_type
        .ok_or_else(|| TemplateError::malformed(format!("resource '{logical_id}' is missing 'Type'")))?;
    if catalog::lookup(&resource_type).is_none() {
        return Err(TemplateError::UnknownResourceType {
            resource: logical_id,
            resource_type,
        });
    }

    let properties = match definition.properties {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(properties)) => properties,
        Some(_) => {
            return Err(TemplateError::malformed(format!("resource '{logical_id}' has non-mapping 'Properties'")));
        }
    };

    let mut depends_on: Vec<String> = Vec::new();
    for dependency in definition.depends_on.map(|depends| depends.into_vec()).unwrap_or_default() {
        if dependency.trim().is_empty() {
            return Err(TemplateError::malformed(format!("resource '{logical_id}' has an empty 'DependsOn' entry")));
        }
        if !depends_on.contains(&dependency) {
            depends_on.push(dependency);
        }
    }

    Ok(ResourceNode {
        logical_id,
        resource_type,
        properties,
        depends_on,
        declaration_index,
        deletion_policy: definition.deletion_policy.unwrap_or_default(),
    })
}

fn parameter_binding(name: String, definition: ParameterDefinition) -> Result<ParameterBinding, TemplateError> {
    let parameter_type = ParameterType::parse(&definition.parameter_type).ok_or_else(|| {
        TemplateError::malformed(format!(
            "parameter '{name}' has unsupported type '{}'",
            definition.parameter_type
        ))
    })?;

    let default = match definition.default {
        None | Some(Value::Null) => None,
        Some(value) => Some(scalar_or_list_text(&name, "Default", &value)?),
    };
    let allowed_values = definition
        .allowed_values
        .iter()
        .map(|value| scalar_text(&name, "AllowedValues", value))
        .collect::<Result<Vec<_>, _>>()?;
    let min_value = definition.min_value.as_ref().map(|value| numeric(&name, "MinValue", value)).transpose()?;
    let max_value = definition.max_value.as_ref().map(|value| numeric(&name, "MaxValue", value)).transpose()?;
    let no_echo = match definition.no_echo {
        None => false,
        Some(Value::Bool(flag)) => flag,
        Some(Value::String(text)) => text.eq_ignore_ascii_case("true"),
        Some(_) => return Err(TemplateError::malformed(format!("parameter '{name}' has a non-boolean 'NoEcho'"))),
    };

    if let Some(pattern) = &definition.allowed_pattern {
        Regex::new(pattern)
            .map_err(|error| TemplateError::malformed(format!("parameter '{name}' has an invalid 'AllowedPattern': {error}")))?;
    }

    Ok(ParameterBinding {
        name,
        parameter_type,
        description: definition.description,
        default,
        allowed_values,
        allowed_pattern: definition.allowed_pattern,
        constraint_description: definition.constraint_description,
        min_length: definition.min_length,
        max_length: definition.max_length,
        min_value,
        max_value,
        no_echo,
    })
}

fn scalar_text(parameter: &str, field: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(TemplateError::malformed(format!("parameter '{parameter}' has a non-scalar '{field}'"))),
    }
}

fn scalar_or_list_text(parameter: &str, field: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| scalar_text(parameter, field, item))
            .collect::<Result<Vec<_>, _>>()
            .map(|items| items.join(",")),
        other => scalar_text(parameter, field, other),
    }
}

fn numeric(parameter: &str, field: &str, value: &Value) -> Result<f64, TemplateError> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| TemplateError::malformed(format!("parameter '{parameter}' has a non-numeric '{field}'")))
}
