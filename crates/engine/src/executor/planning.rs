//! Dry-run planning: what `apply` or `destroy` would do, without provider calls.

use indexmap::IndexSet;
use serde::Serialize;
use strata_types::{DeletionPolicy, ProvisioningStatus, ResourceAction};

use crate::error::{EngineError, EngineResult};
use crate::resolve::ResolvedTemplate;
use crate::resolve::materialize::evaluate_map;
use crate::scheduler::{DependencyMap, deletion_order};
use crate::state::StackState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    pub logical_id: String,
    pub resource_type: String,
    pub action: ResourceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Changes in the order they would be dispatched with a concurrency of one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub stack_name: String,
    pub changes: Vec<PlannedChange>,
    /// Recorded resources the template no longer declares.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub orphans: Vec<PlannedChange>,
}

impl Plan {
    /// True when applying would issue at least one provider call.
    pub fn has_changes(&self) -> bool {
        self.changes
            .iter()
            .chain(&self.orphans)
            .any(|change| matches!(change.action, ResourceAction::Create | ResourceAction::Update | ResourceAction::Delete))
    }

    pub fn count(&self, action: ResourceAction) -> usize {
        self.changes.iter().chain(&self.orphans).filter(|change| change.action == action).count()
    }
}

/// Refuse templates that change the type of a resource that already exists.
pub(crate) fn check_type_changes(resolved: &ResolvedTemplate, state: &StackState) -> EngineResult<()> {
    for node in resolved.graph.iter() {
        if let Some(record) = state.record(node.logical_id())
            && record.is_live()
            && record.resource_type != node.resource_type()
        {
            return Err(EngineError::Lifecycle {
                resource: node.logical_id().to_string(),
                detail: format!(
                    "type changed from '{}' to '{}'; rename the resource to replace it",
                    record.resource_type,
                    node.resource_type()
                ),
            });
        }
    }
    Ok(())
}

/// Compare a resolved template with recorded state.
///
/// Properties that reference resources which do not exist yet cannot be
/// evaluated; such resources are reported as changing.
pub fn plan_apply(resolved: &ResolvedTemplate, state: Option<&StackState>, delete_orphans: bool) -> EngineResult<Plan> {
    let empty = StackState::new(&resolved.stack_name);
    let state = state.unwrap_or(&empty);
    check_type_changes(resolved, state)?;
    let provisioned = state.provisioned();

    let mut changes = Vec::with_capacity(resolved.graph.len());
    for logical_id in resolved.graph.creation_order() {
        let Some(node) = resolved.graph.get(logical_id) else { continue };
        let record = state.record(logical_id).filter(|record| record.is_live());
        let (action, reason) = match record {
            None => (ResourceAction::Create, None),
            Some(record) => match evaluate_map(&node.properties, &provisioned) {
                Ok(properties) if record.status == ProvisioningStatus::Created && record.properties == properties => {
                    (ResourceAction::Noop, None)
                }
                Ok(_) if record.status != ProvisioningStatus::Created => {
                    (ResourceAction::Update, Some(format!("last status was {:?}", record.status).to_lowercase()))
                }
                Ok(_) => (ResourceAction::Update, Some("properties changed".to_string())),
                Err(error) => (ResourceAction::Update, Some(format!("depends on pending changes: {error}"))),
            },
        };
        changes.push(PlannedChange {
            logical_id: logical_id.clone(),
            resource_type: node.resource_type().to_string(),
            action,
            reason,
        });
    }

    let orphans = if delete_orphans {
        let orphan_ids: IndexSet<String> = state
            .live_resources()
            .filter(|(id, _)| !resolved.graph.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        planned_deletions(state, &orphan_ids)?
    } else {
        Vec::new()
    };

    Ok(Plan {
        stack_name: resolved.stack_name.clone(),
        changes,
        orphans,
    })
}

/// Deletions `destroy` would issue, dependents first.
pub fn plan_destroy(state: &StackState) -> EngineResult<Plan> {
    let live: IndexSet<String> = state.live_resources().map(|(id, _)| id.clone()).collect();
    Ok(Plan {
        stack_name: state.stack_name.clone(),
        changes: planned_deletions(state, &live)?,
        orphans: Vec::new(),
    })
}

fn planned_deletions(state: &StackState, targets: &IndexSet<String>) -> EngineResult<Vec<PlannedChange>> {
    let dependencies: DependencyMap = state
        .dependency_map()
        .into_iter()
        .filter(|(id, _)| targets.contains(id))
        .collect();
    let order = deletion_order(&dependencies)?;
    Ok(order
        .into_iter()
        .filter_map(|logical_id| {
            let record = state.record(&logical_id)?;
            let (action, reason) = match record.deletion_policy {
                DeletionPolicy::Retain => (ResourceAction::Skip, Some("retained by deletion policy".to_string())),
                DeletionPolicy::Delete => (ResourceAction::Delete, None),
            };
            Some(PlannedChange {
                resource_type: record.resource_type.clone(),
                logical_id,
                action,
                reason,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_template;
    use crate::resolve::{ResolveInputs, resolve_template};
    use crate::state::ResourceRecord;
    use serde_json::json;

    const TEMPLATE: &str = r#"
Resources:
  VPC:
    Type: AWS::EC2::VPC
    Properties:
      CidrBlock: 10.0.0.0/16
  Subnet:
    Type: AWS::EC2::Subnet
    Properties:
      VpcId: !Ref VPC
"#;

    fn resolved() -> ResolvedTemplate {
        resolve_template(&parse_template(TEMPLATE).unwrap(), &ResolveInputs::new("web")).unwrap()
    }

    fn created(resource_type: &str, physical_id: &str, properties: serde_json::Value, dependencies: &[&str]) -> ResourceRecord {
        let mut record = ResourceRecord::new(resource_type);
        record.physical_id = Some(physical_id.into());
        record.status = ProvisioningStatus::Created;
        record.properties = properties.as_object().cloned().unwrap_or_default();
        record.dependencies = dependencies.iter().map(|id| id.to_string()).collect();
        record
    }

    #[test]
    fn fresh_stack_plans_creates_in_order() {
        let plan = plan_apply(&resolved(), None, true).unwrap();
        let ids: Vec<_> = plan.changes.iter().map(|change| change.logical_id.as_str()).collect();
        assert_eq!(ids, vec!["VPC", "Subnet"]);
        assert_eq!(plan.count(ResourceAction::Create), 2);
        assert!(plan.has_changes());
    }

    #[test]
    fn unchanged_and_orphaned_resources() {
        let mut state = StackState::new("web");
        state.resources.insert(
            "VPC".into(),
            created("AWS::EC2::VPC", "vpc-0a1b2c3d4e5f67890", json!({"CidrBlock": "10.0.0.0/16"}), &[]),
        );
        state.resources.insert(
            "Subnet".into(),
            created("AWS::EC2::Subnet", "subnet-0a1b2c3d4e5f67890", json!({"VpcId": "vpc-0a1b2c3d4e5f67890"}), &["VPC"]),
        );
        state.resources.insert(
            "Gateway".into(),
            created("AWS::EC2::InternetGateway", "igw-0a1b2c3d4e5f67890", json!({}), &[]),
        );

        let plan = plan_apply(&resolved(), Some(&state), true).unwrap();
        assert_eq!(plan.count(ResourceAction::Noop), 2);
        assert_eq!(plan.orphans.len(), 1);
        assert_eq!(plan.orphans[0].action, ResourceAction::Delete);
        assert!(plan.has_changes());

        let plan = plan_apply(&resolved(), Some(&state), false).unwrap();
        assert!(!plan.has_changes());
    }

    #[test]
    fn destroy_plan_deletes_dependents_first() {
        let mut state = StackState::new("web");
        state.resources.insert("VPC".into(), created("AWS::EC2::VPC", "vpc-1", json!({}), &[]));
        let mut subnet = created("AWS::EC2::Subnet", "subnet-1", json!({}), &["VPC"]);
        subnet.deletion_policy = DeletionPolicy::Retain;
        state.resources.insert("Subnet".into(), subnet);

        let plan = plan_destroy(&state).unwrap();
        let ids: Vec<_> = plan.changes.iter().map(|change| (change.logical_id.as_str(), change.action)).collect();
        assert_eq!(ids, vec![("Subnet", ResourceAction::Skip), ("VPC", ResourceAction::Delete)]);
    }

    #[test]
    fn type_changes_are_refused() {
        let mut state = StackState::new("web");
        state.resources.insert("VPC".into(), created("AWS::EC2::InternetGateway", "igw-1", json!({}), &[]));
        let error = plan_apply(&resolved(), Some(&state), true).unwrap_err();
        assert!(matches!(error, EngineError::Lifecycle { ref resource, .. } if resource == "VPC"));
    }
}
