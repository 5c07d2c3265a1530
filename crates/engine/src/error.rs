//! Error taxonomy for the engine.
//!
//! Static errors ([`TemplateError`]) are raised before any provider call is
//! made. Provider failures surface as [`EngineError::TransientProvider`] or
//! [`EngineError::FatalProvider`] once a run has finished and its report is
//! checked.

use thiserror::Error;

use crate::outputs::OutputError;
use crate::state::StateStoreError;

/// Problems found while parsing, validating or resolving a template.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// Syntax errors and structural problems in the document.
    #[error("malformed template: {0}")]
    MalformedTemplate(String),

    /// A resource declares a type the engine does not know how to provision.
    #[error("resource '{resource}' has unknown type '{resource_type}'")]
    UnknownResourceType { resource: String, resource_type: String },

    /// A reference names no resource, parameter, attribute or export.
    #[error("unresolved reference '{reference}' in {location}")]
    UnresolvedReference { reference: String, location: String },

    /// References and `DependsOn` edges form a cycle.
    #[error("cyclic dependency between resources: {}", .members.join(" -> "))]
    CyclicDependency { members: Vec<String> },

    /// A parameter value is missing or violates its declared constraints.
    #[error("invalid value for parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },
}

impl TemplateError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        TemplateError::MalformedTemplate(message.into())
    }

    pub(crate) fn unresolved(reference: impl Into<String>, location: impl Into<String>) -> Self {
        TemplateError::UnresolvedReference {
            reference: reference.into(),
            location: location.into(),
        }
    }
}

/// Errors surfaced by engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A resource kept failing with retryable errors until the retry budget ran out.
    #[error("transient provider error on '{resource}' (retries exhausted): {message}; {summary}")]
    TransientProvider { resource: String, message: String, summary: String },

    /// A resource failed with a non-retryable provider error.
    #[error("fatal provider error on '{resource}': {message}; {summary}")]
    FatalProvider { resource: String, message: String, summary: String },

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Output(#[from] OutputError),

    /// The run was canceled before every resource was dispatched.
    #[error("run canceled; {summary}")]
    Canceled { summary: String },

    /// Destroying the stack would break a stack importing one of its exports.
    #[error("export '{export}' is still imported by stack '{importer}'")]
    ExportInUse { export: String, importer: String },

    /// A lifecycle transition the executor attempted is not allowed.
    #[error("invalid lifecycle transition for '{resource}': {detail}")]
    Lifecycle { resource: String, detail: String },

    /// A worker task panicked or was aborted.
    #[error("provisioning worker failed: {0}")]
    Worker(String),
}

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_dependency_lists_members_in_order() {
        let error = TemplateError::CyclicDependency {
            members: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(error.to_string(), "cyclic dependency between resources: A -> B -> A");
    }

    #[test]
    fn template_errors_convert_into_engine_errors() {
        let error: EngineError = TemplateError::malformed("missing Resources").into();
        assert!(matches!(error, EngineError::Template(TemplateError::MalformedTemplate(_))));
        assert_eq!(error.to_string(), "malformed template: missing Resources");
    }
}
