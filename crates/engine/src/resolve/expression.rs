//! Resolved property expressions.
//!
//! After resolution a property tree contains no parameter names and no raw
//! intrinsic objects: parameter and pseudo-parameter references have been
//! substituted by value, and references to other resources are typed
//! pointers ([`Expr::Ref`], [`Expr::GetAtt`]) evaluated once the target exists.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::Value;

/// A property value with references resolved to typed pointers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Map(IndexMap<String, Expr>),
    /// Physical identifier of another resource.
    Ref(String),
    GetAtt {
        resource: String,
        attribute: String,
    },
    Sub(Vec<SubPart>),
    Join {
        delimiter: String,
        items: Box<Expr>,
    },
    Select {
        index: usize,
        list: Box<Expr>,
    },
    Split {
        delimiter: String,
        source: Box<Expr>,
    },
    Base64(Box<Expr>),
    /// `AWS::NoValue`: the enclosing property or list item is dropped.
    NoValue,
}

/// Segment of an `Fn::Sub` string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubPart {
    Text(String),
    Expr(Expr),
}

impl Expr {
    /// Collect the logical ids of every resource this expression points at.
    pub fn collect_references(&self, references: &mut IndexSet<String>) {
        match self {
            Expr::Literal(_) | Expr::NoValue => {}
            Expr::List(items) => items.iter().for_each(|item| item.collect_references(references)),
            Expr::Map(entries) => entries.values().for_each(|entry| entry.collect_references(references)),
            Expr::Ref(resource) | Expr::GetAtt { resource, .. } => {
                references.insert(resource.clone());
            }
            Expr::Sub(parts) => {
                for part in parts {
                    if let SubPart::Expr(expr) = part {
                        expr.collect_references(references);
                    }
                }
            }
            Expr::Join { items, .. } => items.collect_references(references),
            Expr::Select { list, .. } => list.collect_references(references),
            Expr::Split { source, .. } => source.collect_references(references),
            Expr::Base64(inner) => inner.collect_references(references),
        }
    }

    /// Logical ids referenced by this expression, in discovery order.
    pub fn references(&self) -> IndexSet<String> {
        let mut references = IndexSet::new();
        self.collect_references(&mut references);
        references
    }

    /// True when the expression can be evaluated without any provisioned resource.
    pub fn is_static(&self) -> bool {
        self.references().is_empty()
    }
}
