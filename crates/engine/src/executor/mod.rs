//! Execution engine: provisions a resolved template against a cloud provider.
//!
//! - `apply` creates, updates or leaves alone every resource of the template,
//!   then removes resources the template no longer declares
//! - `destroy` tears a stack down in reverse dependency order
//! - Independent resources run concurrently, up to `max_concurrency` calls
//! - Transient provider errors are retried with backoff ([`retry`])
//! - A failed resource blocks its dependents; unrelated branches carry on
//! - State is persisted through a single [`StateWriter`] after every call

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use strata_types::{DeletionPolicy, ProvisioningStatus, ResourceAction, RunEvent, RunOperation, RunStatus};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::outputs::{check_export_conflicts, evaluate_outputs};
use crate::provider::{CloudProvider, CreateRequest, DeleteRequest, UpdateRequest};
use crate::resolve::ResolvedTemplate;
use crate::resolve::materialize::evaluate_map;
use crate::scheduler::{DependencyMap, WorkQueue};
use crate::state::{ResourceRecord, StackState, StateStore, StateWriter, validate_stack_name};

pub mod lifecycle;
pub mod planning;
pub mod report;
pub mod retry;
mod run;

use lifecycle::LifecycleInput;
pub use planning::{Plan, PlannedChange, plan_apply, plan_destroy};
pub use report::{ApplyReport, FailureSummary, ResourceOutcome};
pub use retry::RetryPolicy;
use run::{Dispatch, Job, RunState, drive};

/// Knobs for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyOptions {
    /// Upper bound on provider calls in flight at once.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Delete resources this run created when any resource fails.
    pub rollback_on_failure: bool,
    /// Delete recorded resources the template no longer declares.
    pub delete_orphans: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            rollback_on_failure: false,
            delete_orphans: true,
        }
    }
}

pub struct Executor {
    provider: Arc<dyn CloudProvider>,
    store: Arc<dyn StateStore>,
    options: ApplyOptions,
    events: Option<UnboundedSender<RunEvent>>,
}

impl Executor {
    pub fn new(provider: Arc<dyn CloudProvider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            options: ApplyOptions::default(),
            events: None,
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Stream [`RunEvent`]s to `sender` while runs progress.
    pub fn with_events(mut self, sender: UnboundedSender<RunEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Bring the provider in line with `resolved`.
    ///
    /// Resource failures do not make this return `Err`; they are reported in
    /// the [`ApplyReport`] (see [`ApplyReport::ensure_success`]). `Err` is kept
    /// for problems that stop the run as a whole: invalid stack names, state
    /// store failures, output and export conflicts. A failed state write stops
    /// dispatch at once; calls already in flight finish first.
    pub async fn apply(&self, resolved: &ResolvedTemplate, cancel: CancellationToken) -> EngineResult<ApplyReport> {
        let stack_name = resolved.stack_name.as_str();
        validate_stack_name(stack_name)?;
        let mut state = self.store.load(stack_name)?.unwrap_or_else(|| StackState::new(stack_name));

        planning::check_type_changes(resolved, &state)?;

        let run_id = Uuid::now_v7().to_string();
        state.generation += 1;
        state.last_run_id = Some(run_id.clone());
        state.imports = resolved.imports.clone();
        state.parameters = resolved.display_parameters.clone();

        let mut resource_types: HashMap<String, String> = state
            .resources
            .iter()
            .map(|(id, record)| (id.clone(), record.resource_type.clone()))
            .collect();
        resource_types.extend(resolved.graph.iter().map(|node| (node.logical_id().to_string(), node.resource_type().to_string())));

        let mut run = RunState::new(
            run_id.clone(),
            RunOperation::Apply,
            state,
            StateWriter::spawn(self.store.clone()),
            resource_types,
            self.events.clone(),
        );
        info!(stack = %stack_name, run_id = %run_id, resources = resolved.graph.len(), "starting apply");
        run.emit(RunEvent::RunStarted {
            run_id,
            stack_name: stack_name.to_string(),
            operation: RunOperation::Apply,
            at: Utc::now(),
        });
        run.recover_interrupted(self.provider.as_ref()).await?;
        run.persist()?;

        drive(&self.provider, &self.options, &mut run, resolved.graph.creation_queue(), &cancel, |run, logical_id| {
            prepare_apply(run, resolved, logical_id)
        })
        .await?;

        let mut output_error = None;
        if run_succeeded(&run) {
            if self.options.delete_orphans {
                let orphans: IndexSet<String> = run
                    .state
                    .live_resources()
                    .filter(|(id, _)| !resolved.graph.contains(id))
                    .map(|(id, _)| id.clone())
                    .collect();
                if !orphans.is_empty() {
                    info!(stack = %stack_name, count = orphans.len(), "deleting resources no longer in the template");
                    let queue = WorkQueue::for_deletion(&restricted(&run.state.dependency_map(), &orphans))?;
                    drive(&self.provider, &self.options, &mut run, queue, &cancel, prepare_delete).await?;
                }
            }

            if run_succeeded(&run) {
                match evaluate_outputs(&resolved.outputs, &run.provisioned) {
                    Ok(evaluated) => {
                        let existing = self.store.exports()?;
                        match check_export_conflicts(stack_name, &evaluated.exports, &existing) {
                            Ok(()) => {
                                run.state.outputs = evaluated.outputs;
                                run.state.exports = evaluated.exports;
                            }
                            Err(error) => output_error = Some(error),
                        }
                    }
                    Err(error) => output_error = Some(error),
                }
            }
        }

        let mut status = if run.canceled {
            RunStatus::Canceled
        } else if run_succeeded(&run) && output_error.is_none() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        let mut rollback = IndexMap::new();
        if status == RunStatus::Failed
            && output_error.is_none()
            && run.state_error.is_none()
            && self.options.rollback_on_failure
            && !run.created.is_empty()
        {
            let created: IndexSet<String> = run.created.iter().cloned().collect();
            warn!(stack = %stack_name, count = created.len(), "rolling back resources created by this run");
            let queue = WorkQueue::for_deletion(&restricted(&run.state.dependency_map(), &created))?;
            let forward_outcomes = std::mem::take(&mut run.outcomes);
            let forward_failure = run.failure.take();
            drive(&self.provider, &self.options, &mut run, queue, &cancel, prepare_delete).await?;
            let rollback_clean = run.failure.is_none() && !run.halted();
            rollback = std::mem::replace(&mut run.outcomes, forward_outcomes);
            run.failure = forward_failure;
            if rollback_clean {
                status = RunStatus::RolledBack;
            }
        }

        let report = self.finish(run, status, rollback).await?;
        if let Some(error) = output_error {
            return Err(error.into());
        }
        Ok(report)
    }

    /// Delete every resource recorded for `stack_name`, dependents first.
    ///
    /// Refuses while another stack imports one of this stack's exports.
    pub async fn destroy(&self, stack_name: &str, cancel: CancellationToken) -> EngineResult<ApplyReport> {
        validate_stack_name(stack_name)?;
        let run_id = Uuid::now_v7().to_string();
        let Some(mut state) = self.store.load(stack_name)? else {
            info!(stack = %stack_name, "nothing recorded for stack; nothing to destroy");
            return Ok(ApplyReport {
                run_id,
                stack_name: stack_name.to_string(),
                operation: RunOperation::Destroy,
                status: RunStatus::Succeeded,
                resources: IndexMap::new(),
                rollback: IndexMap::new(),
                outputs: IndexMap::new(),
                exports: IndexMap::new(),
                failure: None,
            });
        };

        let export_names: Vec<String> = state.exports.keys().cloned().collect();
        if let Some((importer, export)) = self.store.importers_of(stack_name, &export_names)?.into_iter().next() {
            return Err(EngineError::ExportInUse { export, importer });
        }

        state.last_run_id = Some(run_id.clone());
        let resource_types = state
            .resources
            .iter()
            .map(|(id, record)| (id.clone(), record.resource_type.clone()))
            .collect();
        let mut run = RunState::new(
            run_id.clone(),
            RunOperation::Destroy,
            state,
            StateWriter::spawn(self.store.clone()),
            resource_types,
            self.events.clone(),
        );
        info!(stack = %stack_name, run_id = %run_id, "starting destroy");
        run.emit(RunEvent::RunStarted {
            run_id,
            stack_name: stack_name.to_string(),
            operation: RunOperation::Destroy,
            at: Utc::now(),
        });
        run.recover_interrupted(self.provider.as_ref()).await?;
        run.persist()?;

        let queue = WorkQueue::for_deletion(&run.state.dependency_map())?;
        drive(&self.provider, &self.options, &mut run, queue, &cancel, prepare_delete).await?;

        let status = if run.canceled {
            RunStatus::Canceled
        } else if run_succeeded(&run) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.finish(run, status, IndexMap::new()).await
    }

    async fn finish(
        &self,
        mut run: RunState,
        status: RunStatus,
        rollback: IndexMap<String, ResourceOutcome>,
    ) -> EngineResult<ApplyReport> {
        run.state.resources.retain(|_, record| record.status != ProvisioningStatus::Deleted);
        let destroyed = run.operation == RunOperation::Destroy && status == RunStatus::Succeeded;
        if destroyed {
            run.writer.remove(&run.state.stack_name)?;
        } else {
            run.persist()?;
        }

        let report = ApplyReport {
            run_id: run.run_id.clone(),
            stack_name: run.state.stack_name.clone(),
            operation: run.operation,
            status,
            resources: std::mem::take(&mut run.outcomes),
            rollback,
            outputs: if destroyed { IndexMap::new() } else { run.state.outputs.clone() },
            exports: if destroyed { IndexMap::new() } else { run.state.exports.clone() },
            failure: run.failure.clone(),
        };
        info!(stack = %report.stack_name, status = ?status, summary = %report.summary(), "run finished");
        run.emit(RunEvent::RunCompleted {
            status,
            finished_at: Utc::now(),
        });

        let worker_error = run.worker_error.take();
        let state_error = run.state_error.take();
        let closed = run.writer.close().await;
        if let Some(error) = state_error {
            return Err(error.into());
        }
        closed?;
        if let Some(message) = worker_error {
            return Err(EngineError::Worker(message));
        }
        Ok(report)
    }
}

fn run_succeeded(run: &RunState) -> bool {
    run.failure.is_none() && run.worker_error.is_none() && !run.halted()
}

/// Edges of `dependencies` among `keep` only.
fn restricted(dependencies: &DependencyMap, keep: &IndexSet<String>) -> DependencyMap {
    dependencies
        .iter()
        .filter(|(id, _)| keep.contains(*id))
        .map(|(id, prerequisites)| {
            let prerequisites = prerequisites.iter().filter(|dependency| keep.contains(*dependency)).cloned().collect();
            (id.clone(), prerequisites)
        })
        .collect()
}

/// Decide create, update or no-op for a ready resource.
fn prepare_apply(run: &mut RunState, resolved: &ResolvedTemplate, logical_id: &str) -> EngineResult<Dispatch> {
    let Some(node) = resolved.graph.get(logical_id) else {
        return Ok(Dispatch::Settled);
    };
    let properties = match evaluate_map(&node.properties, &run.provisioned) {
        Ok(properties) => properties,
        Err(error) => {
            run.fail_before_call(logical_id, ResourceAction::Create, error.to_string());
            return Ok(Dispatch::Failed);
        }
    };

    let stack_name = run.state.stack_name.clone();
    let generation = run.state.generation;
    let record = run
        .state
        .resources
        .entry(logical_id.to_string())
        .or_insert_with(|| ResourceRecord::new(node.resource_type()));
    record.dependencies = node.dependencies.iter().cloned().collect();
    record.deletion_policy = node.resource.deletion_policy;

    if record.status == ProvisioningStatus::Created
        && let Some(physical_id) = record.physical_id.clone()
        && record.properties == properties
    {
        let outcome = ResourceOutcome {
            logical_id: logical_id.to_string(),
            resource_type: node.resource_type().to_string(),
            action: ResourceAction::Noop,
            status: ProvisioningStatus::Created,
            physical_id: Some(physical_id),
            attempts: 0,
            duration_ms: 0,
            error: None,
            skipped_reason: None,
        };
        run.emit(RunEvent::ResourceStarted {
            logical_id: logical_id.to_string(),
            action: ResourceAction::Noop,
            at: Utc::now(),
        });
        run.settle(outcome);
        return Ok(Dispatch::Settled);
    }

    let job = match record.physical_id.clone() {
        Some(physical_id) if record.is_live() => Job::Update(UpdateRequest {
            logical_id: logical_id.to_string(),
            resource_type: node.resource_type().to_string(),
            physical_id,
            properties,
        }),
        _ => {
            // A token survives only while no resource is known for it, so a
            // create interrupted before its response is deduplicated on retry.
            let token = match (&record.idempotency_token, &record.physical_id) {
                (Some(token), None) => token.clone(),
                _ => format!("{stack_name}-{logical_id}-{generation}"),
            };
            record.idempotency_token = Some(token.clone());
            record.physical_id = None;
            Job::Create(CreateRequest {
                logical_id: logical_id.to_string(),
                resource_type: node.resource_type().to_string(),
                properties,
                idempotency_token: token,
            })
        }
    };

    run.begin(logical_id, job.action())?;
    Ok(Dispatch::Spawn(job))
}

/// Issue a delete, or leave the resource behind when it is retained.
fn prepare_delete(run: &mut RunState, logical_id: &str) -> EngineResult<Dispatch> {
    let Some(record) = run.state.record(logical_id) else {
        return Ok(Dispatch::Settled);
    };
    let resource_type = record.resource_type.clone();
    let physical_id = record.physical_id.clone();

    if record.deletion_policy == DeletionPolicy::Retain {
        run.transition(logical_id, LifecycleInput::Delete)?;
        run.provisioned.remove(logical_id);
        run.skip(logical_id, "retained by deletion policy");
        run.persist()?;
        return Ok(Dispatch::Settled);
    }
    let Some(physical_id) = physical_id else {
        return Ok(Dispatch::Settled);
    };

    run.begin(logical_id, ResourceAction::Delete)?;
    Ok(Dispatch::Spawn(Job::Delete(DeleteRequest {
        logical_id: logical_id.to_string(),
        resource_type,
        physical_id,
    })))
}
