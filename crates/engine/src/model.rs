//! # Parsed Template Model
//!
//! In-memory form of a template after parsing and structural validation, but
//! before any reference has been resolved.
//!
//! - **ParsedTemplate**: parameters, resources and outputs in declaration order
//! - **ResourceNode**: one declared resource with its raw properties and explicit `DependsOn`
//! - **ParameterBinding**: a declared parameter with its validation constraints
//! - **OutputNode**: a declared output with its raw value and export name expressions

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_types::DeletionPolicy;

/// A structurally valid template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTemplate {
    pub description: Option<String>,
    pub parameters: IndexMap<String, ParameterBinding>,
    pub resources: IndexMap<String, ResourceNode>,
    pub outputs: IndexMap<String, OutputNode>,
}

/// One declared resource. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Logical name, unique within the template.
    pub logical_id: String,
    /// Resource type tag such as `AWS::EC2::Subnet`.
    pub resource_type: String,
    /// Raw property mapping; intrinsic functions are still unevaluated JSON.
    pub properties: Map<String, Value>,
    /// Explicit `DependsOn` entries, in authoring order.
    pub depends_on: Vec<String>,
    /// Position of the resource in the `Resources` section.
    pub declaration_index: usize,
    pub deletion_policy: DeletionPolicy,
}

/// Declared type of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    String,
    Number,
    NumberList,
    CommaDelimitedList,
    /// Provider-specific scalar such as `AWS::EC2::KeyPair::KeyName`.
    ProviderScalar(String),
    /// Provider-specific list such as `List<AWS::EC2::Subnet::Id>`.
    ProviderList(String),
}

impl ParameterType {
    /// Parse the `Type` field of a parameter declaration.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw {
            "String" => Some(ParameterType::String),
            "Number" => Some(ParameterType::Number),
            "List<Number>" => Some(ParameterType::NumberList),
            "CommaDelimitedList" => Some(ParameterType::CommaDelimitedList),
            _ => {
                if let Some(inner) = raw.strip_prefix("List<").and_then(|rest| rest.strip_suffix('>'))
                    && inner.starts_with("AWS::")
                {
                    return Some(ParameterType::ProviderList(inner.to_string()));
                }
                if raw.starts_with("AWS::") {
                    return Some(ParameterType::ProviderScalar(raw.to_string()));
                }
                None
            }
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self,
            ParameterType::NumberList | ParameterType::CommaDelimitedList | ParameterType::ProviderList(_)
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ParameterType::Number | ParameterType::NumberList)
    }
}

/// A declared parameter with its constraints. Validated before resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBinding {
    pub name: String,
    pub parameter_type: ParameterType,
    pub description: Option<String>,
    /// Default rendered to its string form.
    pub default: Option<String>,
    /// Enumerated values rendered to their string form; empty when unconstrained.
    pub allowed_values: Vec<String>,
    pub allowed_pattern: Option<String>,
    pub constraint_description: Option<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    /// Value must be masked when displayed.
    pub no_echo: bool,
}

/// A declared stack output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputNode {
    pub name: String,
    pub description: Option<String>,
    pub value: Value,
    pub export_name: Option<Value>,
}
