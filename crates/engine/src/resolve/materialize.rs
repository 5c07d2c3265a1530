//! Evaluation of resolved expressions into concrete JSON values once the
//! resources they point at have been provisioned.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

use super::expression::{Expr, SubPart};
use crate::provider::ProvisionedResource;

/// Read access to provisioned resources for expression evaluation.
pub trait AttributeSource {
    fn physical_id(&self, logical_id: &str) -> Option<String>;
    fn attribute(&self, logical_id: &str, attribute: &str) -> Option<Value>;
}

impl AttributeSource for HashMap<String, ProvisionedResource> {
    fn physical_id(&self, logical_id: &str) -> Option<String> {
        self.get(logical_id).map(|resource| resource.physical_id.clone())
    }

    fn attribute(&self, logical_id: &str, attribute: &str) -> Option<Value> {
        self.get(logical_id).and_then(|resource| resource.attributes.get(attribute).cloned())
    }
}

/// Source with no resources; evaluates static expressions only.
pub struct NoResources;

impl AttributeSource for NoResources {
    fn physical_id(&self, _logical_id: &str) -> Option<String> {
        None
    }

    fn attribute(&self, _logical_id: &str, _attribute: &str) -> Option<Value> {
        None
    }
}

/// Evaluation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MaterializeError {
    #[error("resource '{0}' has not been provisioned")]
    NotProvisioned(String),
    #[error("resource '{resource}' did not report attribute '{attribute}'")]
    MissingAttribute { resource: String, attribute: String },
    #[error("{0}")]
    Invalid(String),
}

/// Evaluate an expression. `None` means `AWS::NoValue`.
pub fn evaluate(expr: &Expr, source: &dyn AttributeSource) -> Result<Option<Value>, MaterializeError> {
    let value = match expr {
        Expr::Literal(value) => value.clone(),
        Expr::NoValue => return Ok(None),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                if let Some(value) = evaluate(item, source)? {
                    values.push(value);
                }
            }
            Value::Array(values)
        }
        Expr::Map(entries) => Value::Object(evaluate_map(entries, source)?),
        Expr::Ref(resource) => {
            let physical_id = source
                .physical_id(resource)
                .ok_or_else(|| MaterializeError::NotProvisioned(resource.clone()))?;
            Value::String(physical_id)
        }
        Expr::GetAtt { resource, attribute } => {
            if source.physical_id(resource).is_none() {
                return Err(MaterializeError::NotProvisioned(resource.clone()));
            }
            source
                .attribute(resource, attribute)
                .ok_or_else(|| MaterializeError::MissingAttribute {
                    resource: resource.clone(),
                    attribute: attribute.clone(),
                })?
        }
        Expr::Sub(parts) => {
            let mut rendered = String::new();
            for part in parts {
                match part {
                    SubPart::Text(text) => rendered.push_str(text),
                    SubPart::Expr(expr) => {
                        if let Some(value) = evaluate(expr, source)? {
                            rendered.push_str(&render_text(&value)?);
                        }
                    }
                }
            }
            Value::String(rendered)
        }
        Expr::Join { delimiter, items } => {
            let items = expect_list(evaluate(items, source)?, "Fn::Join")?;
            let rendered = items.iter().map(render_text).collect::<Result<Vec<_>, _>>()?;
            Value::String(rendered.join(delimiter))
        }
        Expr::Select { index, list } => {
            let items = expect_list(evaluate(list, source)?, "Fn::Select")?;
            let length = items.len();
            items.into_iter().nth(*index).ok_or_else(|| {
                MaterializeError::Invalid(format!("Fn::Select index {index} is out of range for a list of {length}"))
            })?
        }
        Expr::Split { delimiter, source: inner } => {
            let text = match evaluate(inner, source)? {
                Some(value) => render_text(&value)?,
                None => String::new(),
            };
            Value::Array(text.split(delimiter.as_str()).map(|part| Value::String(part.to_string())).collect())
        }
        Expr::Base64(inner) => {
            let text = match evaluate(inner, source)? {
                Some(value) => render_text(&value)?,
                None => String::new(),
            };
            Value::String(STANDARD.encode(text.as_bytes()))
        }
    };
    Ok(Some(value))
}

/// Evaluate a property mapping, dropping `AWS::NoValue` entries.
pub fn evaluate_map(entries: &IndexMap<String, Expr>, source: &dyn AttributeSource) -> Result<Map<String, Value>, MaterializeError> {
    let mut object = Map::new();
    for (key, expr) in entries {
        if let Some(value) = evaluate(expr, source)? {
            object.insert(key.clone(), value);
        }
    }
    Ok(object)
}

/// Render a scalar (or list of scalars) the way string interpolation does.
pub fn render_text(value: &Value) -> Result<String, MaterializeError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Null => Ok(String::new()),
        Value::Array(items) => items.iter().map(render_text).collect::<Result<Vec<_>, _>>().map(|items| items.join(",")),
        Value::Object(_) => Err(MaterializeError::Invalid("cannot interpolate an object into a string".into())),
    }
}

fn expect_list(value: Option<Value>, function: &str) -> Result<Vec<Value>, MaterializeError> {
    match value {
        Some(Value::Array(items)) => Ok(items),
        None => Ok(Vec::new()),
        Some(other) => Err(MaterializeError::Invalid(format!("{function} expects a list, found {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provisioned() -> HashMap<String, ProvisionedResource> {
        HashMap::from([(
            "LoadBalancer".to_string(),
            ProvisionedResource {
                physical_id: "arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/app/web/abc".into(),
                attributes: IndexMap::from([("DNSName".to_string(), json!("web-1.us-east-1.elb.amazonaws.com"))]),
            },
        )])
    }

    #[test]
    fn evaluates_sub_with_attribute() {
        let expr = Expr::Sub(vec![
            SubPart::Text("http://".into()),
            SubPart::Expr(Expr::GetAtt {
                resource: "LoadBalancer".into(),
                attribute: "DNSName".into(),
            }),
        ]);
        let value = evaluate(&expr, &provisioned()).unwrap();
        assert_eq!(value, Some(json!("http://web-1.us-east-1.elb.amazonaws.com")));
    }

    #[test]
    fn reports_unprovisioned_and_missing_attributes() {
        let error = evaluate(&Expr::Ref("VPC".into()), &provisioned()).unwrap_err();
        assert_eq!(error, MaterializeError::NotProvisioned("VPC".into()));

        let expr = Expr::GetAtt {
            resource: "LoadBalancer".into(),
            attribute: "CanonicalHostedZoneID".into(),
        };
        assert!(matches!(evaluate(&expr, &provisioned()), Err(MaterializeError::MissingAttribute { .. })));
    }

    #[test]
    fn join_select_split_and_base64() {
        let list = Expr::Literal(json!(["us-east-1a", "us-east-1b"]));
        let join = Expr::Join {
            delimiter: "|".into(),
            items: Box::new(list.clone()),
        };
        assert_eq!(evaluate(&join, &NoResources).unwrap(), Some(json!("us-east-1a|us-east-1b")));

        let select = Expr::Select {
            index: 1,
            list: Box::new(list.clone()),
        };
        assert_eq!(evaluate(&select, &NoResources).unwrap(), Some(json!("us-east-1b")));

        let out_of_range = Expr::Select {
            index: 5,
            list: Box::new(list),
        };
        assert!(matches!(evaluate(&out_of_range, &NoResources), Err(MaterializeError::Invalid(_))));

        let split = Expr::Split {
            delimiter: ",".into(),
            source: Box::new(Expr::Literal(json!("a,b"))),
        };
        assert_eq!(evaluate(&split, &NoResources).unwrap(), Some(json!(["a", "b"])));

        let encoded = Expr::Base64(Box::new(Expr::Literal(json!("#!/bin/bash"))));
        assert_eq!(evaluate(&encoded, &NoResources).unwrap(), Some(json!("IyEvYmluL2Jhc2g=")));
    }

    #[test]
    fn no_value_entries_are_dropped() {
        let entries = IndexMap::from([
            ("KeyName".to_string(), Expr::NoValue),
            ("ImageId".to_string(), Expr::Literal(json!("ami-123"))),
            ("Tags".to_string(), Expr::List(vec![Expr::NoValue, Expr::Literal(json!("x"))])),
        ]);
        let object = evaluate_map(&entries, &NoResources).unwrap();
        assert_eq!(Value::Object(object), json!({"ImageId": "ami-123", "Tags": ["x"]}));
    }
}
