//! Conversion of YAML documents into JSON values with short-form intrinsic
//! tags expanded to their long form.
//!
//! `!Ref Name` becomes `{"Ref": "Name"}`, `!GetAtt A.B` becomes
//! `{"Fn::GetAtt": ["A", "B"]}`, and any other `!Fn` tag becomes
//! `{"Fn::Fn": <value>}`. Unsupported function names are rejected later by the
//! resolver so the error can name the resource that uses them.

use serde_json::{Map, Number, Value};
use serde_yaml::Value as YamlValue;

use crate::error::TemplateError;

/// Convert a YAML value to JSON, expanding intrinsic tags.
pub fn yaml_to_json(value: YamlValue) -> Result<Value, TemplateError> {
    match value {
        YamlValue::Null => Ok(Value::Null),
        YamlValue::Bool(flag) => Ok(Value::Bool(flag)),
        YamlValue::Number(number) => Ok(convert_number(&number)),
        YamlValue::String(text) => Ok(Value::String(text)),
        YamlValue::Sequence(items) => items.into_iter().map(yaml_to_json).collect::<Result<Vec<_>, _>>().map(Value::Array),
        YamlValue::Mapping(mapping) => {
            let mut object = Map::new();
            for (key, value) in mapping {
                let key = mapping_key(key)?;
                object.insert(key, yaml_to_json(value)?);
            }
            Ok(Value::Object(object))
        }
        YamlValue::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            let name = tag.trim_start_matches('!');
            let inner = yaml_to_json(tagged.value)?;
            Ok(expand_tag(name, inner))
        }
    }
}

fn expand_tag(name: &str, inner: Value) -> Value {
    let mut object = Map::new();
    match name {
        "Ref" => {
            object.insert("Ref".into(), inner);
        }
        "GetAtt" => {
            let inner = match inner {
                Value::String(path) => match path.split_once('.') {
                    Some((resource, attribute)) => Value::Array(vec![Value::String(resource.into()), Value::String(attribute.into())]),
                    None => Value::String(path),
                },
                other => other,
            };
            object.insert("Fn::GetAtt".into(), inner);
        }
        other => {
            object.insert(format!("Fn::{other}"), inner);
        }
    }
    Value::Object(object)
}

fn mapping_key(key: YamlValue) -> Result<String, TemplateError> {
    match key {
        YamlValue::String(text) => Ok(text),
        YamlValue::Number(number) => Ok(number.to_string()),
        YamlValue::Bool(flag) => Ok(flag.to_string()),
        other => Err(TemplateError::malformed(format!("mapping keys must be scalars, found {other:?}"))),
    }
}

fn convert_number(number: &serde_yaml::Number) -> Value {
    if let Some(unsigned) = number.as_u64() {
        return Value::Number(Number::from(unsigned));
    }
    if let Some(signed) = number.as_i64() {
        return Value::Number(Number::from(signed));
    }
    number
        .as_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(number.to_string()))
}
