//! Persisted stack state.
//!
//! The state store keeps the last-known-good picture of every stack: physical
//! ids, attributes, the properties each resource was created with, evaluated
//! outputs and published exports. It is what makes re-applying a template
//! idempotent and what `destroy` and rollback work from.
//!
//! Backends implement [`StateStore`]. During a run all writes go through a
//! single [`StateWriter`] task so snapshots never interleave.

mod json;
mod memory;
mod writer;

pub use json::{JsonStateStore, STATE_DIR_NAME, STATE_PATH_ENV, default_state_dir, expand_tilde_path};
pub use memory::InMemoryStateStore;
pub use writer::StateWriter;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_types::{DeletionPolicy, ProvisioningStatus};
use thiserror::Error;

use crate::provider::ProvisionedResource;
use crate::scheduler::DependencyMap;

static STACK_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").expect("valid stack name pattern"));

/// Errors surfaced by state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// I/O failure while reading or writing state.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stack name '{0}': use letters, digits and hyphens, starting with a letter")]
    InvalidStackName(String),
    /// The writer task stopped before all snapshots were persisted.
    #[error("state writer is no longer running")]
    WriterClosed,
}

/// Reject names that cannot be used as a stack (and state file) name.
pub fn validate_stack_name(stack_name: &str) -> Result<(), StateStoreError> {
    if STACK_NAME.is_match(stack_name) {
        Ok(())
    } else {
        Err(StateStoreError::InvalidStackName(stack_name.to_string()))
    }
}

/// Everything recorded about one stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub stack_name: String,
    /// Bumped by every apply; part of each idempotency token.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub last_run_id: Option<String>,
    /// Resources in the order they were first recorded.
    #[serde(default)]
    pub resources: IndexMap<String, ResourceRecord>,
    /// Parameter values of the last apply, `NoEcho` values masked.
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    #[serde(default)]
    pub outputs: IndexMap<String, Value>,
    /// Export name → value, visible to other stacks.
    #[serde(default)]
    pub exports: IndexMap<String, Value>,
    /// Export names of other stacks this stack consumes.
    #[serde(default)]
    pub imports: IndexSet<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StackState {
    pub fn new(stack_name: impl Into<String>) -> Self {
        Self {
            stack_name: stack_name.into(),
            ..Default::default()
        }
    }

    pub fn record(&self, logical_id: &str) -> Option<&ResourceRecord> {
        self.resources.get(logical_id)
    }

    /// Records that still exist at the provider.
    pub fn live_resources(&self) -> impl Iterator<Item = (&String, &ResourceRecord)> {
        self.resources.iter().filter(|(_, record)| record.is_live())
    }

    /// Dependency edges between live resources, in record order.
    pub fn dependency_map(&self) -> DependencyMap {
        self.live_resources()
            .map(|(id, record)| {
                let dependencies = record
                    .dependencies
                    .iter()
                    .filter(|dependency| self.resources.get(*dependency).is_some_and(ResourceRecord::is_live))
                    .cloned()
                    .collect();
                (id.clone(), dependencies)
            })
            .collect()
    }

    /// Resources recorded as created, keyed by logical id.
    pub fn provisioned(&self) -> HashMap<String, ProvisionedResource> {
        self.resources
            .iter()
            .filter(|(_, record)| record.status == ProvisioningStatus::Created)
            .filter_map(|(id, record)| {
                let physical_id = record.physical_id.clone()?;
                Some((
                    id.clone(),
                    ProvisionedResource {
                        physical_id,
                        attributes: record.attributes.clone(),
                    },
                ))
            })
            .collect()
    }

    /// True once no resource is left at the provider.
    pub fn is_empty(&self) -> bool {
        self.live_resources().next().is_none()
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// Last known state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_type: String,
    #[serde(default)]
    pub physical_id: Option<String>,
    pub status: ProvisioningStatus,
    /// Materialised properties the resource was last created or updated with.
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub attributes: IndexMap<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Token of the create call in flight or last issued.
    #[serde(default)]
    pub idempotency_token: Option<String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ResourceRecord {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            physical_id: None,
            status: ProvisioningStatus::Pending,
            properties: Map::new(),
            attributes: IndexMap::new(),
            dependencies: Vec::new(),
            idempotency_token: None,
            deletion_policy: DeletionPolicy::Delete,
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    /// The resource may exist at the provider.
    pub fn is_live(&self) -> bool {
        self.physical_id.is_some() && self.status != ProvisioningStatus::Deleted
    }
}

/// An export together with the stack that publishes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub stack_name: String,
    pub value: Value,
}

/// Shared trait implemented by state persistence backends.
pub trait StateStore: Send + Sync {
    /// Load a stack's state; `None` when the stack has never been applied.
    fn load(&self, stack_name: &str) -> Result<Option<StackState>, StateStoreError>;

    /// Replace the stored state of `state.stack_name`.
    fn save(&self, state: &StackState) -> Result<(), StateStoreError>;

    fn remove(&self, stack_name: &str) -> Result<(), StateStoreError>;

    /// Names of all stored stacks, sorted.
    fn list_stacks(&self) -> Result<Vec<String>, StateStoreError>;

    /// Exports published by every stored stack.
    fn exports(&self) -> Result<IndexMap<String, ExportRecord>, StateStoreError> {
        let mut exports = IndexMap::new();
        for stack_name in self.list_stacks()? {
            let Some(state) = self.load(&stack_name)? else { continue };
            for (name, value) in state.exports {
                exports.insert(
                    name,
                    ExportRecord {
                        stack_name: stack_name.clone(),
                        value,
                    },
                );
            }
        }
        Ok(exports)
    }

    /// Stacks (other than `stack_name`) importing any of `export_names`, as `(importer, export)`.
    fn importers_of(&self, stack_name: &str, export_names: &[String]) -> Result<Vec<(String, String)>, StateStoreError> {
        let mut importers = Vec::new();
        for other in self.list_stacks()? {
            if other == stack_name {
                continue;
            }
            let Some(state) = self.load(&other)? else { continue };
            for export in export_names {
                if state.imports.contains(export) {
                    importers.push((other.clone(), export.clone()));
                }
            }
        }
        Ok(importers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn created(physical_id: &str, dependencies: &[&str]) -> ResourceRecord {
        let mut record = ResourceRecord::new("AWS::EC2::VPC");
        record.physical_id = Some(physical_id.into());
        record.status = ProvisioningStatus::Created;
        record.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        record
    }

    #[test]
    fn stack_names_are_validated() {
        assert!(validate_stack_name("web-prod").is_ok());
        assert!(validate_stack_name("1web").is_err());
        assert!(validate_stack_name("../etc").is_err());
        assert!(validate_stack_name("").is_err());
    }

    #[test]
    fn dependency_map_skips_deleted_records() {
        let mut state = StackState::new("web");
        state.resources.insert("VPC".into(), created("vpc-1", &[]));
        state.resources.insert("Subnet".into(), created("subnet-1", &["VPC"]));
        let mut gone = created("igw-1", &["VPC"]);
        gone.status = ProvisioningStatus::Deleted;
        state.resources.insert("Gateway".into(), gone);

        let map = state.dependency_map();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["VPC", "Subnet"]);
        assert!(map["Subnet"].contains("VPC"));
        assert!(!state.is_empty());
    }

    #[test]
    fn state_deserializes_with_missing_optional_fields() {
        let state: StackState = serde_json::from_value(json!({"stack_name": "web"})).unwrap();
        assert_eq!(state.generation, 0);
        assert!(state.resources.is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn default_exports_and_importers_scan_every_stack() {
        let store = InMemoryStateStore::new();
        let mut network = StackState::new("network");
        network.exports.insert("network-VpcId".into(), json!("vpc-1"));
        store.save(&network).unwrap();
        let mut app = StackState::new("app");
        app.imports.insert("network-VpcId".into());
        store.save(&app).unwrap();

        let exports = store.exports().unwrap();
        assert_eq!(exports["network-VpcId"].stack_name, "network");
        assert_eq!(exports["network-VpcId"].value, json!("vpc-1"));

        let importers = store.importers_of("network", &["network-VpcId".to_string()]).unwrap();
        assert_eq!(importers, vec![("app".to_string(), "network-VpcId".to_string())]);
    }
}
