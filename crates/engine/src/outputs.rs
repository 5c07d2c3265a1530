//! Stack outputs and cross-stack exports.
//!
//! Outputs are evaluated once every resource exists. Outputs with an
//! `Export` name are published so other stacks can `Fn::ImportValue` them;
//! export names are unique across all stacks in a state store.

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::resolve::ResolvedOutput;
use crate::resolve::materialize::{AttributeSource, MaterializeError, evaluate, render_text};
use crate::state::ExportRecord;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutputError {
    #[error("output '{output}' could not be evaluated: {source}")]
    Evaluation { output: String, source: MaterializeError },
    #[error("export name of output '{output}' must be a non-empty string")]
    InvalidExportName { output: String },
    #[error("export '{export}' is declared by more than one output")]
    DuplicateExport { export: String },
    #[error("export '{export}' is already published by stack '{owner}'")]
    ExportConflict { export: String, owner: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluatedOutputs {
    pub outputs: IndexMap<String, Value>,
    /// Export name → value.
    pub exports: IndexMap<String, Value>,
}

/// Evaluate every output against provisioned resources.
pub fn evaluate_outputs(outputs: &IndexMap<String, ResolvedOutput>, source: &dyn AttributeSource) -> Result<EvaluatedOutputs, OutputError> {
    let mut evaluated = EvaluatedOutputs::default();
    for (name, output) in outputs {
        let evaluation = |source_error| OutputError::Evaluation {
            output: name.clone(),
            source: source_error,
        };
        let value = evaluate(&output.value, source).map_err(evaluation)?.unwrap_or(Value::Null);

        if let Some(export_name) = &output.export_name {
            let export_name = evaluate(export_name, source).map_err(evaluation)?.unwrap_or(Value::Null);
            let export_name = render_text(&export_name).map_err(evaluation)?;
            if export_name.trim().is_empty() {
                return Err(OutputError::InvalidExportName { output: name.clone() });
            }
            if evaluated.exports.insert(export_name.clone(), value.clone()).is_some() {
                return Err(OutputError::DuplicateExport { export: export_name });
            }
        }
        evaluated.outputs.insert(name.clone(), value);
    }
    Ok(evaluated)
}

/// Reject exports another stack already owns.
pub fn check_export_conflicts(
    stack_name: &str,
    exports: &IndexMap<String, Value>,
    existing: &IndexMap<String, ExportRecord>,
) -> Result<(), OutputError> {
    for export in exports.keys() {
        if let Some(record) = existing.get(export)
            && record.stack_name != stack_name
        {
            return Err(OutputError::ExportConflict {
                export: export.clone(),
                owner: record.stack_name.clone(),
            });
        }
    }
    Ok(())
}
