//! # Reference Resolution
//!
//! Turns a [`ParsedTemplate`] into a [`ResolvedTemplate`]: parameters are bound
//! and validated, every property is compiled into an [`Expr`] tree, and the
//! resource references discovered along the way (plus explicit `DependsOn`)
//! become the edges of an acyclic [`DependencyGraph`].
//!
//! Resolution happens once, up front. Nothing is evaluated lazily at access
//! time, so ordering problems and dangling names are reported before any
//! provider call is made.
//!
//! ## Supported intrinsics
//!
//! - `Ref` to a parameter, pseudo parameter or resource
//! - `Fn::GetAtt`, `Fn::Sub`, `Fn::Join`, `Fn::Select`, `Fn::Split`, `Fn::Base64`
//! - `Fn::GetAZs` and `Fn::ImportValue`, evaluated during resolution

use std::cell::RefCell;
use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tracing::debug;

use crate::{
    catalog,
    error::TemplateError,
    graph::{DependencyGraph, GraphNode},
    model::{ParsedTemplate, ResourceNode},
    parameters::{bind_parameters, masked_parameters},
};

pub mod expression;
pub mod materialize;

pub use expression::{Expr, SubPart};
use materialize::{NoResources, evaluate, render_text};

/// Account id used when the caller does not supply one.
pub const DEFAULT_ACCOUNT_ID: &str = "123456789012";
/// Region used when the caller does not supply one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Everything outside the template that resolution needs.
#[derive(Debug, Clone)]
pub struct ResolveInputs {
    pub stack_name: String,
    pub region: String,
    pub account_id: String,
    /// Raw parameter values supplied by the caller.
    pub parameters: HashMap<String, String>,
    /// Values exported by other stacks, by export name.
    pub exports: IndexMap<String, Value>,
    /// Availability zones returned by `Fn::GetAZs` for the stack's region.
    pub availability_zones: Vec<String>,
}

impl ResolveInputs {
    pub fn new(stack_name: impl Into<String>) -> Self {
        Self {
            stack_name: stack_name.into(),
            region: DEFAULT_REGION.into(),
            account_id: DEFAULT_ACCOUNT_ID.into(),
            parameters: HashMap::new(),
            exports: IndexMap::new(),
            availability_zones: zones_for_region(DEFAULT_REGION),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self.availability_zones = zones_for_region(&self.region);
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_exports(mut self, exports: IndexMap<String, Value>) -> Self {
        self.exports = exports;
        self
    }
}

fn zones_for_region(region: &str) -> Vec<String> {
    ["a", "b", "c"].iter().map(|suffix| format!("{region}{suffix}")).collect()
}

/// A stack output with its expressions resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOutput {
    pub name: String,
    pub description: Option<String>,
    pub value: Expr,
    pub export_name: Option<Expr>,
}

/// Output of the resolution pass.
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub stack_name: String,
    pub graph: DependencyGraph,
    pub outputs: IndexMap<String, ResolvedOutput>,
    /// Bound parameter values, unmasked.
    pub parameters: IndexMap<String, Value>,
    /// Bound parameter values with `NoEcho` values masked.
    pub display_parameters: IndexMap<String, Value>,
    /// Export names consumed through `Fn::ImportValue`.
    pub imports: IndexSet<String>,
}

/// Resolve all references in a parsed template.
pub fn resolve_template(template: &ParsedTemplate, inputs: &ResolveInputs) -> Result<ResolvedTemplate, TemplateError> {
    let parameters = bind_parameters(&template.parameters, &inputs.parameters)?;
    let compiler = Compiler {
        resources: &template.resources,
        parameters: &parameters,
        inputs,
        imports: RefCell::new(IndexSet::new()),
    };

    let mut nodes = Vec::with_capacity(template.resources.len());
    for resource in template.resources.values() {
        nodes.push(compiler.compile_resource(resource)?);
    }
    let graph = DependencyGraph::build(nodes)?;

    let mut outputs = IndexMap::with_capacity(template.outputs.len());
    for (name, output) in &template.outputs {
        let location = format!("output '{name}'");
        let value = compiler.compile(&output.value, &location)?;
        let export_name = output
            .export_name
            .as_ref()
            .map(|export_name| compiler.compile(export_name, &location))
            .transpose()?;
        outputs.insert(
            name.clone(),
            ResolvedOutput {
                name: name.clone(),
                description: output.description.clone(),
                value,
                export_name,
            },
        );
    }

    debug!(
        stack = %inputs.stack_name,
        resources = graph.len(),
        outputs = outputs.len(),
        "resolved template"
    );

    Ok(ResolvedTemplate {
        stack_name: inputs.stack_name.clone(),
        graph,
        outputs,
        display_parameters: masked_parameters(&template.parameters, &parameters),
        imports: compiler.imports.into_inner(),
        parameters,
    })
}

struct Compiler<'a> {
    resources: &'a IndexMap<String, ResourceNode>,
    parameters: &'a IndexMap<String, Value>,
    inputs: &'a ResolveInputs,
    imports: RefCell<IndexSet<String>>,
}

impl Compiler<'_> {
    fn compile_resource(&self, resource: &ResourceNode) -> Result<GraphNode, TemplateError> {
        let location = format!("resource '{}'", resource.logical_id);
        let mut dependencies = IndexSet::new();
        for dependency in &resource.depends_on {
            if !self.resources.contains_key(dependency) {
                return Err(TemplateError::unresolved(dependency, format!("DependsOn of {location}")));
            }
            dependencies.insert(dependency.clone());
        }

        let mut properties = IndexMap::with_capacity(resource.properties.len());
        for (key, raw) in &resource.properties {
            let expr = self.compile(raw, &location)?;
            expr.collect_references(&mut dependencies);
            properties.insert(key.clone(), expr);
        }

        if let Some(kind) = catalog::lookup(&resource.resource_type) {
            for required in kind.required_properties {
                let present = properties.get(*required).is_some_and(|expr| *expr != Expr::NoValue);
                if !present {
                    return Err(TemplateError::malformed(format!(
                        "{location} of type {} is missing required property '{required}'",
                        resource.resource_type
                    )));
                }
            }
        }

        Ok(GraphNode {
            resource: resource.clone(),
            properties,
            dependencies,
        })
    }

    fn compile(&self, value: &Value, location: &str) -> Result<Expr, TemplateError> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.compile(item, location))
                .collect::<Result<Vec<_>, _>>()
                .map(Expr::List),
            Value::Object(object) => {
                if object.len() == 1
                    && let Some((key, argument)) = object.iter().next()
                {
                    if key == "Ref" {
                        return self.compile_ref(argument, location);
                    }
                    if let Some(function) = key.strip_prefix("Fn::") {
                        return self.compile_function(function, argument, location);
                    }
                }
                let mut entries = IndexMap::with_capacity(object.len());
                for (key, entry) in object {
                    entries.insert(key.clone(), self.compile(entry, location)?);
                }
                Ok(Expr::Map(entries))
            }
            scalar => Ok(Expr::Literal(scalar.clone())),
        }
    }

    fn compile_ref(&self, argument: &Value, location: &str) -> Result<Expr, TemplateError> {
        let name = argument
            .as_str()
            .ok_or_else(|| TemplateError::malformed(format!("Ref in {location} must name a string")))?;
        self.reference_by_name(name, location)
    }

    fn reference_by_name(&self, name: &str, location: &str) -> Result<Expr, TemplateError> {
        if let Some(value) = self.parameters.get(name) {
            return Ok(Expr::Literal(value.clone()));
        }
        if let Some(pseudo) = self.pseudo_parameter(name) {
            return Ok(pseudo);
        }
        if self.resources.contains_key(name) {
            return Ok(Expr::Ref(name.to_string()));
        }
        Err(TemplateError::unresolved(name, location))
    }

    fn pseudo_parameter(&self, name: &str) -> Option<Expr> {
        let value = match name {
            "AWS::NoValue" => return Some(Expr::NoValue),
            "AWS::StackName" => self.inputs.stack_name.clone(),
            "AWS::Region" => self.inputs.region.clone(),
            "AWS::AccountId" => self.inputs.account_id.clone(),
            "AWS::Partition" => "aws".to_string(),
            "AWS::URLSuffix" => "amazonaws.com".to_string(),
            _ => return None,
        };
        Some(Expr::Literal(Value::String(value)))
    }

    fn compile_function(&self, function: &str, argument: &Value, location: &str) -> Result<Expr, TemplateError> {
        match function {
            "GetAtt" => self.compile_get_att(argument, location),
            "Sub" => self.compile_sub(argument, location),
            "Join" => {
                let (delimiter, items) = pair(argument, "Fn::Join", location)?;
                let delimiter = delimiter
                    .as_str()
                    .ok_or_else(|| TemplateError::malformed(format!("Fn::Join delimiter in {location} must be a string")))?;
                Ok(Expr::Join {
                    delimiter: delimiter.to_string(),
                    items: Box::new(self.compile(items, location)?),
                })
            }
            "Select" => {
                let (index, list) = pair(argument, "Fn::Select", location)?;
                let index = self.compile(index, location)?;
                let index = self.static_text(&index, "Fn::Select index", location)?;
                let index = index
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| TemplateError::malformed(format!("Fn::Select index '{index}' in {location} is not a number")))?;
                Ok(Expr::Select {
                    index,
                    list: Box::new(self.compile(list, location)?),
                })
            }
            "Split" => {
                let (delimiter, source) = pair(argument, "Fn::Split", location)?;
                let delimiter = delimiter
                    .as_str()
                    .ok_or_else(|| TemplateError::malformed(format!("Fn::Split delimiter in {location} must be a string")))?;
                Ok(Expr::Split {
                    delimiter: delimiter.to_string(),
                    source: Box::new(self.compile(source, location)?),
                })
            }
            "Base64" => Ok(Expr::Base64(Box::new(self.compile(argument, location)?))),
            "GetAZs" => {
                let region = self.compile(argument, location)?;
                let region = self.static_text(&region, "Fn::GetAZs region", location)?;
                let zones = if region.is_empty() || region == self.inputs.region {
                    self.inputs.availability_zones.clone()
                } else {
                    zones_for_region(&region)
                };
                Ok(Expr::Literal(Value::Array(zones.into_iter().map(Value::String).collect())))
            }
            "ImportValue" => {
                let name = self.compile(argument, location)?;
                let name = self.static_text(&name, "Fn::ImportValue name", location)?;
                let value = self
                    .inputs
                    .exports
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| TemplateError::unresolved(format!("export '{name}'"), location))?;
                self.imports.borrow_mut().insert(name);
                Ok(Expr::Literal(value))
            }
            other => Err(TemplateError::malformed(format!(
                "unsupported intrinsic function 'Fn::{other}' in {location}"
            ))),
        }
    }

    fn compile_get_att(&self, argument: &Value, location: &str) -> Result<Expr, TemplateError> {
        let (resource, attribute) = match argument {
            Value::String(path) => path
                .split_once('.')
                .map(|(resource, attribute)| (resource.to_string(), attribute.to_string()))
                .ok_or_else(|| TemplateError::malformed(format!("Fn::GetAtt '{path}' in {location} must be 'Resource.Attribute'")))?,
            Value::Array(parts) => match parts.as_slice() {
                [Value::String(resource), Value::String(attribute)] => (resource.clone(), attribute.clone()),
                _ => {
                    return Err(TemplateError::malformed(format!(
                        "Fn::GetAtt in {location} must be [resource, attribute]"
                    )));
                }
            },
            _ => return Err(TemplateError::malformed(format!("Fn::GetAtt in {location} has an invalid argument"))),
        };
        self.get_att(resource, attribute, location)
    }

    fn get_att(&self, resource: String, attribute: String, location: &str) -> Result<Expr, TemplateError> {
        let reference = format!("{resource}.{attribute}");
        let node = self
            .resources
            .get(&resource)
            .ok_or_else(|| TemplateError::unresolved(&reference, location))?;
        let exposes_attribute = catalog::lookup(&node.resource_type).is_some_and(|kind| kind.has_attribute(&attribute));
        if !exposes_attribute {
            return Err(TemplateError::unresolved(reference, location));
        }
        Ok(Expr::GetAtt { resource, attribute })
    }

    fn compile_sub(&self, argument: &Value, location: &str) -> Result<Expr, TemplateError> {
        let (text, variables) = match argument {
            Value::String(text) => (text.as_str(), IndexMap::new()),
            Value::Array(parts) => match parts.as_slice() {
                [Value::String(text), Value::Object(raw_variables)] => {
                    let mut variables = IndexMap::with_capacity(raw_variables.len());
                    for (name, raw) in raw_variables {
                        variables.insert(name.clone(), self.compile(raw, location)?);
                    }
                    (text.as_str(), variables)
                }
                _ => {
                    return Err(TemplateError::malformed(format!(
                        "Fn::Sub in {location} must be a string or [string, variables]"
                    )));
                }
            },
            _ => return Err(TemplateError::malformed(format!("Fn::Sub in {location} has an invalid argument"))),
        };

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| TemplateError::malformed(format!("unterminated '${{' in Fn::Sub in {location}")))?;
            let name = &after[..end];
            rest = &after[end + 1..];

            if let Some(escaped) = name.strip_prefix('!') {
                literal.push_str("${");
                literal.push_str(escaped);
                literal.push('}');
                continue;
            }

            let name = name.trim();
            let expr = if let Some(variable) = variables.get(name) {
                variable.clone()
            } else if let Some((resource, attribute)) = name.split_once('.')
                && !name.starts_with("AWS::")
            {
                self.get_att(resource.to_string(), attribute.to_string(), location)?
            } else {
                self.reference_by_name(name, location)?
            };

            if !literal.is_empty() {
                parts.push(SubPart::Text(std::mem::take(&mut literal)));
            }
            parts.push(SubPart::Expr(expr));
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(SubPart::Text(literal));
        }
        Ok(Expr::Sub(parts))
    }

    fn static_text(&self, expr: &Expr, what: &str, location: &str) -> Result<String, TemplateError> {
        if !expr.is_static() {
            return Err(TemplateError::malformed(format!("{what} in {location} cannot reference resources")));
        }
        let value = evaluate(expr, &NoResources)
            .map_err(|error| TemplateError::malformed(format!("{what} in {location}: {error}")))?
            .unwrap_or(Value::Null);
        render_text(&value).map_err(|error| TemplateError::malformed(format!("{what} in {location}: {error}")))
    }
}

fn pair<'v>(argument: &'v Value, function: &str, location: &str) -> Result<(&'v Value, &'v Value), TemplateError> {
    match argument.as_array().map(Vec::as_slice) {
        Some([first, second]) => Ok((first, second)),
        _ => Err(TemplateError::malformed(format!("{function} in {location} takes exactly two arguments"))),
    }
}
