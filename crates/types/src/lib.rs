//! Shared type definitions for Strata.
//!
//! - [`template`] mirrors the on-disk template document (parameters, resources, outputs)
//! - [`provisioning`] carries lifecycle statuses and the run events streamed by the engine

pub mod provisioning;
pub mod template;

pub use provisioning::{ProvisioningStatus, ResourceAction, RunEvent, RunOperation, RunStatus};
pub use template::{
    DeletionPolicy, DependsOn, ExportDefinition, OutputDefinition, ParameterDefinition, ResourceDefinition, TemplateDocument,
};
