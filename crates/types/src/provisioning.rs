//! Provisioning lifecycle statuses and the events emitted while a run progresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a single resource within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// A provider call is in flight.
    InProgress,
    /// The resource exists at the provider.
    Created,
    /// The last provider call failed.
    Failed,
    /// The resource has been removed from the provider.
    Deleted,
}

impl ProvisioningStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProvisioningStatus::Created | ProvisioningStatus::Failed | ProvisioningStatus::Deleted)
    }
}

/// The provider call chosen for a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
    /// Already up to date; no provider call issued.
    Noop,
    /// Never dispatched because a dependency failed or the run was canceled.
    Skip,
}

/// Which pipeline a run executes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    Apply,
    Destroy,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
    RolledBack,
}

/// Lifecycle events streamed by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        stack_name: String,
        operation: RunOperation,
        at: DateTime<Utc>,
    },
    ResourceStarted {
        logical_id: String,
        action: ResourceAction,
        at: DateTime<Utc>,
    },
    ResourceRetrying {
        logical_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ResourceFinished {
        logical_id: String,
        action: ResourceAction,
        status: ProvisioningStatus,
        physical_id: Option<String>,
        attempts: u32,
        duration_ms: u64,
        error: Option<String>,
    },
    ResourceSkipped {
        logical_id: String,
        reason: String,
    },
    RunCompleted {
        status: RunStatus,
        finished_at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!ProvisioningStatus::Pending.is_terminal());
        assert!(!ProvisioningStatus::InProgress.is_terminal());
        assert!(ProvisioningStatus::Created.is_terminal());
        assert!(ProvisioningStatus::Failed.is_terminal());
        assert!(ProvisioningStatus::Deleted.is_terminal());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = RunEvent::ResourceSkipped {
            logical_id: "Subnet".into(),
            reason: "dependency 'VPC' failed".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "resource_skipped");
        assert_eq!(json["logical_id"], "Subnet");
    }
}
