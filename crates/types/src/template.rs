//! Serde model of a declarative infrastructure template.
//!
//! The structures follow the CloudFormation authoring format: PascalCase keys,
//! a `Resources` mapping of logical id to typed definition, optional
//! `Parameters` and `Outputs`. Maps are `IndexMap`s so declaration order is
//! preserved; the scheduler uses that order to break ties.
//!
//! Intrinsic functions are kept as raw JSON values here. The engine normalises
//! YAML short-form tags (`!Ref`, `!Sub`, ...) into their long form before
//! deserializing into these types.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A whole template document.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TemplateDocument {
    #[serde(default, rename = "AWSTemplateFormatVersion")]
    pub format_version: Option<String>,
    #[serde(default, rename = "Description")]
    pub description: Option<String>,
    #[serde(default, rename = "Parameters")]
    pub parameters: IndexMap<String, ParameterDefinition>,
    #[serde(default, rename = "Resources")]
    pub resources: IndexMap<String, ResourceDefinition>,
    #[serde(default, rename = "Outputs")]
    pub outputs: IndexMap<String, OutputDefinition>,
}

/// Declaration of a template parameter.
///
/// `MinValue`, `MaxValue` and `NoEcho` are commonly authored either as native
/// scalars or as strings, so they are kept as raw values and coerced by the
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterDefinition {
    #[serde(rename = "Type")]
    pub parameter_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub allowed_values: Vec<Value>,
    #[serde(default)]
    pub allowed_pattern: Option<String>,
    #[serde(default)]
    pub constraint_description: Option<String>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min_value: Option<Value>,
    #[serde(default)]
    pub max_value: Option<Value>,
    #[serde(default)]
    pub no_echo: Option<Value>,
}

/// Declaration of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceDefinition {
    /// Resource type tag such as `AWS::EC2::VPC`. Optional at the serde layer so
    /// the parser can report a missing type against the offending resource.
    #[serde(default, rename = "Type")]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub depends_on: Option<DependsOn>,
    #[serde(default)]
    pub deletion_policy: Option<DeletionPolicy>,
}

/// `DependsOn` accepts either a single logical id or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DependsOn {
    Single(String),
    Many(Vec<String>),
}

impl DependsOn {
    /// Flatten into a list of logical ids.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            DependsOn::Single(name) => vec![name],
            DependsOn::Many(names) => names,
        }
    }
}

/// What happens to the physical resource when it leaves the stack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Retain,
}

/// Declaration of a stack output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OutputDefinition {
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub export: Option<ExportDefinition>,
}

/// Export block of an output; the name may itself be an intrinsic expression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ExportDefinition {
    pub name: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_pascal_case_document() {
        let yaml = r#"
AWSTemplateFormatVersion: "2010-09-09"
Parameters:
  InstanceType:
    Type: String
    Default: t3.micro
    AllowedValues: [t3.micro, t3.small]
Resources:
  VPC:
    Type: AWS::EC2::VPC
    Properties:
      CidrBlock: 10.0.0.0/16
  Subnet:
    Type: AWS::EC2::Subnet
    DependsOn: VPC
    DeletionPolicy: Retain
    Properties:
      VpcId: { Ref: VPC }
Outputs:
  VpcId:
    Value: { Ref: VPC }
    Export:
      Name: shared-vpc
"#;
        let document: TemplateDocument = serde_yaml::from_str(yaml).expect("document");
        assert_eq!(document.format_version.as_deref(), Some("2010-09-09"));
        assert_eq!(document.parameters["InstanceType"].allowed_values.len(), 2);
        let keys: Vec<&str> = document.resources.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["VPC", "Subnet"]);

        let subnet = &document.resources["Subnet"];
        assert_eq!(subnet.resource_type.as_deref(), Some("AWS::EC2::Subnet"));
        assert_eq!(subnet.depends_on, Some(DependsOn::Single("VPC".into())));
        assert_eq!(subnet.deletion_policy, Some(DeletionPolicy::Retain));
        assert!(document.outputs["VpcId"].export.is_some());
    }

    #[test]
    fn depends_on_list_flattens() {
        let depends: DependsOn = serde_json::from_str(r#"["A", "B"]"#).unwrap();
        assert_eq!(depends.into_vec(), vec!["A".to_string(), "B".to_string()]);
    }
}
