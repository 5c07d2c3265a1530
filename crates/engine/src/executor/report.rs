//! Partial-completion summaries returned by `apply` and `destroy`.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use strata_types::{ProvisioningStatus, ResourceAction, RunOperation, RunStatus};

use crate::error::{EngineError, EngineResult};
use crate::provider::ProviderErrorKind;

/// What happened to one resource during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceOutcome {
    pub logical_id: String,
    pub resource_type: String,
    pub action: ResourceAction,
    pub status: ProvisioningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the resource was not touched (failed dependency, cancellation, retention).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

impl ResourceOutcome {
    pub(crate) fn skipped(logical_id: &str, resource_type: &str, status: ProvisioningStatus, reason: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            resource_type: resource_type.to_string(),
            action: ResourceAction::Skip,
            status,
            physical_id: None,
            attempts: 0,
            duration_ms: 0,
            error: None,
            skipped_reason: Some(reason.into()),
        }
    }
}

/// The first resource failure of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub resource: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub run_id: String,
    pub stack_name: String,
    pub operation: RunOperation,
    pub status: RunStatus,
    /// Forward outcomes, in completion order.
    pub resources: IndexMap<String, ResourceOutcome>,
    /// Deletions issued while rolling back.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub rollback: IndexMap<String, ResourceOutcome>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub exports: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn outcome(&self, logical_id: &str) -> Option<&ResourceOutcome> {
        self.resources.get(logical_id)
    }

    /// Resources that ended a run with the given action.
    pub fn with_action(&self, action: ResourceAction) -> Vec<&str> {
        self.resources
            .values()
            .filter(|outcome| outcome.action == action && outcome.error.is_none())
            .map(|outcome| outcome.logical_id.as_str())
            .collect()
    }

    /// One-line tally such as `2 created, 1 unchanged, 1 failed, 3 skipped`.
    pub fn summary(&self) -> String {
        let mut created = 0;
        let mut updated = 0;
        let mut deleted = 0;
        let mut unchanged = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for outcome in self.resources.values() {
            if outcome.error.is_some() {
                failed += 1;
                continue;
            }
            match outcome.action {
                ResourceAction::Create => created += 1,
                ResourceAction::Update => updated += 1,
                ResourceAction::Delete => deleted += 1,
                ResourceAction::Noop => unchanged += 1,
                ResourceAction::Skip => skipped += 1,
            }
        }

        let parts: Vec<String> = [
            (created, "created"),
            (updated, "updated"),
            (deleted, "deleted"),
            (unchanged, "unchanged"),
            (failed, "failed"),
            (skipped, "skipped"),
        ]
        .into_iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{count} {label}"))
        .collect();

        let mut summary = if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        };
        if !self.rollback.is_empty() {
            summary.push_str(&format!("; {} rolled back", self.rollback.len()));
        }
        summary
    }

    /// Turn a failed or canceled run into the matching error.
    pub fn ensure_success(self) -> EngineResult<Self> {
        if let Some(failure) = &self.failure {
            let summary = self.summary();
            return Err(match failure.kind {
                ProviderErrorKind::Transient => EngineError::TransientProvider {
                    resource: failure.resource.clone(),
                    message: failure.message.clone(),
                    summary,
                },
                ProviderErrorKind::Fatal => EngineError::FatalProvider {
                    resource: failure.resource.clone(),
                    message: failure.message.clone(),
                    summary,
                },
            });
        }
        if self.status == RunStatus::Canceled {
            return Err(EngineError::Canceled { summary: self.summary() });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(logical_id: &str, action: ResourceAction, error: Option<&str>) -> ResourceOutcome {
        ResourceOutcome {
            logical_id: logical_id.into(),
            resource_type: "AWS::EC2::VPC".into(),
            action,
            status: if error.is_some() {
                ProvisioningStatus::Failed
            } else {
                ProvisioningStatus::Created
            },
            physical_id: None,
            attempts: 1,
            duration_ms: 3,
            error: error.map(str::to_string),
            skipped_reason: None,
        }
    }

    fn report(resources: Vec<ResourceOutcome>, failure: Option<FailureSummary>) -> ApplyReport {
        ApplyReport {
            run_id: "run".into(),
            stack_name: "web".into(),
            operation: RunOperation::Apply,
            status: if failure.is_some() { RunStatus::Failed } else { RunStatus::Succeeded },
            resources: resources.into_iter().map(|outcome| (outcome.logical_id.clone(), outcome)).collect(),
            rollback: IndexMap::new(),
            outputs: IndexMap::new(),
            exports: IndexMap::new(),
            failure,
        }
    }

    #[test]
    fn summary_counts_each_action() {
        let report = report(
            vec![
                outcome("VPC", ResourceAction::Create, None),
                outcome("Subnet", ResourceAction::Noop, None),
                outcome("Instance", ResourceAction::Create, Some("quota")),
                ResourceOutcome::skipped("Listener", "AWS::ElasticLoadBalancingV2::Listener", ProvisioningStatus::Pending, "dependency failed"),
            ],
            None,
        );
        assert_eq!(report.summary(), "1 created, 1 unchanged, 1 failed, 1 skipped");
        assert_eq!(report.with_action(ResourceAction::Create), vec!["VPC"]);
    }

    #[test]
    fn ensure_success_maps_failure_kind() {
        let failure = FailureSummary {
            resource: "Instance".into(),
            message: "LimitExceeded: quota".into(),
            kind: ProviderErrorKind::Fatal,
        };
        let error = report(vec![outcome("Instance", ResourceAction::Create, Some("quota"))], Some(failure))
            .ensure_success()
            .unwrap_err();
        assert!(matches!(error, EngineError::FatalProvider { ref resource, .. } if resource == "Instance"));
        assert!(error.to_string().contains("1 failed"));

        let failure = FailureSummary {
            resource: "VPC".into(),
            message: "Throttling".into(),
            kind: ProviderErrorKind::Transient,
        };
        let error = report(Vec::new(), Some(failure)).ensure_success().unwrap_err();
        assert!(matches!(error, EngineError::TransientProvider { .. }));

        assert!(report(Vec::new(), None).ensure_success().is_ok());
    }
}
