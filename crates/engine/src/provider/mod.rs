//! Cloud provider boundary.
//!
//! Modules:
//! - `simulated`: in-memory provider with fault injection, used by tests and the CLI
//!
//! The engine only issues typed create/read/update/delete requests through
//! [`CloudProvider`] and interprets the responses; it never talks to a real
//! cloud API itself.

mod simulated;

pub use simulated::{CallCounts, ProviderCall, ProviderOperation, SimulatedProvider};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity and attributes of a resource that exists at the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub physical_id: String,
    #[serde(default)]
    pub attributes: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub logical_id: String,
    pub resource_type: String,
    /// Fully materialised properties; no references remain.
    pub properties: Map<String, Value>,
    /// Repeating a create with the same token returns the original resource.
    pub idempotency_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub logical_id: String,
    pub resource_type: String,
    pub physical_id: String,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub logical_id: String,
    pub resource_type: String,
    pub physical_id: String,
}

/// Whether retrying a failed call can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Throttling, eventual-consistency lookups and similar.
    Transient,
    /// Invalid properties, exhausted quotas, missing targets.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Resource-management API of a cloud provider.
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create(&self, request: CreateRequest) -> Result<ProvisionedResource, ProviderError>;

    /// `Ok(None)` when the resource does not exist.
    async fn read(&self, resource_type: &str, physical_id: &str) -> Result<Option<ProvisionedResource>, ProviderError>;

    async fn update(&self, request: UpdateRequest) -> Result<ProvisionedResource, ProviderError>;

    /// Deleting a resource that is already gone succeeds.
    async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_report_kind_and_code() {
        let throttled = ProviderError::transient("Throttling", "rate exceeded");
        assert!(throttled.is_transient());
        assert_eq!(throttled.to_string(), "Throttling: rate exceeded");

        let quota = ProviderError::fatal("VpcLimitExceeded", "maximum number of VPCs reached");
        assert!(!quota.is_transient());
    }
}
