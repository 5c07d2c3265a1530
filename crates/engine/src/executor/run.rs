//! One provisioning run.
//!
//! [`RunState`] owns the stack state for the duration of a run; it is only
//! mutated here, on the coordinating task, when a provider call completes.
//! [`drive`] pulls ready resources from a [`WorkQueue`], runs at most
//! `max_concurrency` provider calls at a time on a [`JoinSet`], and stops
//! dispatching (but lets in-flight calls finish) once the run is canceled or
//! a state write fails. Every queued snapshot is confirmed written before the
//! next provider call is issued.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use strata_types::{ProvisioningStatus, ResourceAction, RunEvent, RunOperation};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ApplyOptions;
use super::lifecycle::{LifecycleInput, transition};
use super::report::{FailureSummary, ResourceOutcome};
use super::retry::{Attempted, RetryPolicy, with_retry};
use crate::error::EngineError;
use crate::provider::{CloudProvider, CreateRequest, DeleteRequest, ProviderError, ProviderErrorKind, ProvisionedResource, UpdateRequest};
use crate::scheduler::WorkQueue;
use crate::state::{StackState, StateStoreError, StateWriter};

const STATE_UNAVAILABLE: &str = "stack state could not be persisted";

/// A provider call to make for one resource.
#[derive(Debug, Clone)]
pub(super) enum Job {
    Create(CreateRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

impl Job {
    fn logical_id(&self) -> &str {
        match self {
            Job::Create(request) => &request.logical_id,
            Job::Update(request) => &request.logical_id,
            Job::Delete(request) => &request.logical_id,
        }
    }

    pub(super) fn action(&self) -> ResourceAction {
        match self {
            Job::Create(_) => ResourceAction::Create,
            Job::Update(_) => ResourceAction::Update,
            Job::Delete(_) => ResourceAction::Delete,
        }
    }

    fn properties(&self) -> Option<&Map<String, Value>> {
        match self {
            Job::Create(request) => Some(&request.properties),
            Job::Update(request) => Some(&request.properties),
            Job::Delete(_) => None,
        }
    }
}

/// What the caller decided for a ready resource.
pub(super) enum Dispatch {
    /// Issue a provider call.
    Spawn(Job),
    /// Already settled without a call; dependents may proceed.
    Settled,
    /// Settled as failed without a call; dependents are blocked.
    Failed,
}

struct TaskOutcome {
    logical_id: String,
    action: ResourceAction,
    properties: Option<Map<String, Value>>,
    result: Result<Option<ProvisionedResource>, ProviderError>,
    attempts: u32,
    duration: Duration,
}

pub(super) struct RunState {
    pub run_id: String,
    pub operation: RunOperation,
    pub state: StackState,
    pub writer: StateWriter,
    /// Resources that currently exist, for expression evaluation.
    pub provisioned: HashMap<String, ProvisionedResource>,
    pub outcomes: IndexMap<String, ResourceOutcome>,
    /// Resources created by this run, in completion order.
    pub created: Vec<String>,
    pub failure: Option<FailureSummary>,
    pub worker_error: Option<String>,
    /// First state write that failed; no provider call is issued after it.
    pub state_error: Option<StateStoreError>,
    pub canceled: bool,
    resource_types: HashMap<String, String>,
    events: Option<UnboundedSender<RunEvent>>,
}

impl RunState {
    pub fn new(
        run_id: String,
        operation: RunOperation,
        state: StackState,
        writer: StateWriter,
        resource_types: HashMap<String, String>,
        events: Option<UnboundedSender<RunEvent>>,
    ) -> Self {
        let provisioned = state.provisioned();

        Self {
            run_id,
            operation,
            state,
            writer,
            provisioned,
            outcomes: IndexMap::new(),
            created: Vec::new(),
            failure: None,
            worker_error: None,
            state_error: None,
            canceled: false,
            resource_types,
            events,
        }
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn persist(&mut self) -> Result<(), EngineError> {
        self.state.touch();
        self.writer.save(&self.state)?;
        Ok(())
    }

    /// Canceled, or state can no longer be written.
    pub fn halted(&self) -> bool {
        self.canceled || self.state_error.is_some()
    }

    /// Wait for queued snapshots; `false` once any of them failed.
    async fn sync_state(&mut self) -> bool {
        if self.state_error.is_some() {
            return false;
        }
        match self.writer.flush().await {
            Ok(()) => true,
            Err(error) => {
                warn!(stack = %self.state.stack_name, %error, "stack state could not be persisted; stopping dispatch");
                self.state_error = Some(error);
                false
            }
        }
    }

    pub fn resource_type(&self, logical_id: &str) -> String {
        self.state
            .resources
            .get(logical_id)
            .map(|record| record.resource_type.clone())
            .or_else(|| self.resource_types.get(logical_id).cloned())
            .unwrap_or_default()
    }

    pub fn transition(&mut self, logical_id: &str, input: LifecycleInput) -> Result<ProvisioningStatus, EngineError> {
        let record = self.state.resources.get_mut(logical_id).ok_or_else(|| EngineError::Lifecycle {
            resource: logical_id.to_string(),
            detail: "no state record".into(),
        })?;
        let next = transition(record.status, input).ok_or_else(|| EngineError::Lifecycle {
            resource: logical_id.to_string(),
            detail: format!("{:?} cannot accept {:?}", record.status, input),
        })?;
        record.status = next;
        record.updated_at = Utc::now();
        Ok(next)
    }

    /// Mark a resource in progress and persist before the call is issued.
    pub fn begin(&mut self, logical_id: &str, action: ResourceAction) -> Result<(), EngineError> {
        self.transition(logical_id, LifecycleInput::Start)?;
        self.emit(RunEvent::ResourceStarted {
            logical_id: logical_id.to_string(),
            action,
            at: Utc::now(),
        });
        self.persist()
    }

    pub fn settle(&mut self, outcome: ResourceOutcome) {
        self.emit(RunEvent::ResourceFinished {
            logical_id: outcome.logical_id.clone(),
            action: outcome.action,
            status: outcome.status,
            physical_id: outcome.physical_id.clone(),
            attempts: outcome.attempts,
            duration_ms: outcome.duration_ms,
            error: outcome.error.clone(),
        });
        self.outcomes.insert(outcome.logical_id.clone(), outcome);
    }

    pub fn skip(&mut self, logical_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        let status = self
            .state
            .resources
            .get(logical_id)
            .map_or(ProvisioningStatus::Pending, |record| record.status);
        debug!(resource = %logical_id, %reason, "skipping resource");
        self.emit(RunEvent::ResourceSkipped {
            logical_id: logical_id.to_string(),
            reason: reason.clone(),
        });
        let resource_type = self.resource_type(logical_id);
        self.outcomes
            .insert(logical_id.to_string(), ResourceOutcome::skipped(logical_id, &resource_type, status, reason));
    }

    /// Record a failure that happened before any provider call.
    pub fn fail_before_call(&mut self, logical_id: &str, action: ResourceAction, message: String) {
        warn!(resource = %logical_id, error = %message, "resource cannot be provisioned");
        self.note_failure(logical_id, &message, ProviderErrorKind::Fatal);
        self.settle(ResourceOutcome {
            logical_id: logical_id.to_string(),
            resource_type: self.resource_type(logical_id),
            action,
            status: ProvisioningStatus::Failed,
            physical_id: None,
            attempts: 0,
            duration_ms: 0,
            error: Some(message),
            skipped_reason: None,
        });
    }

    fn note_failure(&mut self, logical_id: &str, message: &str, kind: ProviderErrorKind) {
        if self.failure.is_none() {
            self.failure = Some(FailureSummary {
                resource: logical_id.to_string(),
                message: message.to_string(),
                kind,
            });
        }
    }

    /// Settle records a previous run left `InProgress`.
    ///
    /// Records without a physical id go back to `Pending` and keep their
    /// idempotency token. Records with one are looked up: still present means
    /// `Failed` (so the next apply re-sends its properties), gone means `Deleted`.
    pub async fn recover_interrupted(&mut self, provider: &dyn CloudProvider) -> Result<(), EngineError> {
        let interrupted: Vec<(String, String, Option<String>)> = self
            .state
            .resources
            .iter()
            .filter(|(_, record)| record.status == ProvisioningStatus::InProgress)
            .map(|(id, record)| (id.clone(), record.resource_type.clone(), record.physical_id.clone()))
            .collect();

        for (logical_id, resource_type, physical_id) in interrupted {
            info!(resource = %logical_id, "recovering resource interrupted by an earlier run");
            let Some(physical_id) = physical_id else {
                self.transition(&logical_id, LifecycleInput::Reset)?;
                continue;
            };
            match provider.read(&resource_type, &physical_id).await {
                Ok(Some(resource)) => {
                    self.transition(&logical_id, LifecycleInput::Fail)?;
                    if let Some(record) = self.state.resources.get_mut(&logical_id) {
                        record.attributes = resource.attributes;
                        record.last_error = Some("interrupted by an earlier run".into());
                    }
                }
                Ok(None) => {
                    self.transition(&logical_id, LifecycleInput::Delete)?;
                }
                Err(error) => {
                    warn!(resource = %logical_id, %error, "could not read interrupted resource");
                    self.transition(&logical_id, LifecycleInput::Fail)?;
                    if let Some(record) = self.state.resources.get_mut(&logical_id) {
                        record.last_error = Some(error.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    fn complete(&mut self, queue: &mut WorkQueue, outcome: TaskOutcome) -> Result<(), EngineError> {
        let TaskOutcome {
            logical_id,
            action,
            properties,
            result,
            attempts,
            duration,
        } = outcome;
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(resource) => {
                let status = match action {
                    ResourceAction::Delete => self.transition(&logical_id, LifecycleInput::Delete)?,
                    _ => self.transition(&logical_id, LifecycleInput::Succeed)?,
                };
                let physical_id = match resource {
                    Some(resource) => {
                        if let Some(record) = self.state.resources.get_mut(&logical_id) {
                            record.physical_id = Some(resource.physical_id.clone());
                            record.attributes = resource.attributes.clone();
                            record.properties = properties.unwrap_or_default();
                            record.last_error = None;
                        }
                        let physical_id = resource.physical_id.clone();
                        self.provisioned.insert(logical_id.clone(), resource);
                        Some(physical_id)
                    }
                    None => {
                        self.provisioned.remove(&logical_id);
                        self.state.record(&logical_id).and_then(|record| record.physical_id.clone())
                    }
                };
                if action == ResourceAction::Create {
                    self.created.push(logical_id.clone());
                }
                info!(resource = %logical_id, ?action, attempts, duration_ms, "resource settled");
                self.settle(ResourceOutcome {
                    resource_type: self.resource_type(&logical_id),
                    logical_id: logical_id.clone(),
                    action,
                    status,
                    physical_id,
                    attempts,
                    duration_ms,
                    error: None,
                    skipped_reason: None,
                });
                queue.complete(&logical_id);
            }
            Err(error) => {
                let status = self.transition(&logical_id, LifecycleInput::Fail)?;
                let message = error.to_string();
                if let Some(record) = self.state.resources.get_mut(&logical_id) {
                    record.last_error = Some(message.clone());
                }
                warn!(resource = %logical_id, ?action, attempts, error = %message, "provider call failed");
                self.note_failure(&logical_id, &message, error.kind);
                self.settle(ResourceOutcome {
                    resource_type: self.resource_type(&logical_id),
                    logical_id: logical_id.clone(),
                    action,
                    status,
                    physical_id: self.state.record(&logical_id).and_then(|record| record.physical_id.clone()),
                    attempts,
                    duration_ms,
                    error: Some(message),
                    skipped_reason: None,
                });
                for blocked in queue.fail(&logical_id) {
                    self.skip(&blocked, format!("blocked by failure of '{logical_id}'"));
                }
            }
        }
        self.persist()
    }
}

/// Work through `queue`, asking `prepare` what to do with each ready resource.
pub(super) async fn drive<F>(
    provider: &Arc<dyn CloudProvider>,
    options: &ApplyOptions,
    run: &mut RunState,
    mut queue: WorkQueue,
    cancel: &CancellationToken,
    mut prepare: F,
) -> Result<(), EngineError>
where
    F: FnMut(&mut RunState, &str) -> Result<Dispatch, EngineError>,
{
    let max_concurrency = options.max_concurrency.max(1);
    let mut in_flight: JoinSet<TaskOutcome> = JoinSet::new();
    let mut tasks: HashMap<Id, String> = HashMap::new();
    let mut dispatching = !run.halted();

    loop {
        if dispatching {
            if cancel.is_cancelled() {
                run.canceled = true;
            }
            if run.halted() {
                dispatching = false;
                let reason = if run.state_error.is_some() {
                    STATE_UNAVAILABLE
                } else {
                    "run canceled before dispatch"
                };
                info!(in_flight = in_flight.len(), %reason, "dispatch stopped; waiting for in-flight calls");
                for logical_id in queue.drain_undispatched() {
                    run.skip(&logical_id, reason);
                }
            }
        }

        if dispatching {
            while in_flight.len() < max_concurrency {
                let Some(logical_id) = queue.pop_ready() else { break };
                match prepare(run, &logical_id)? {
                    Dispatch::Spawn(job) => {
                        if !run.sync_state().await {
                            run.transition(&logical_id, LifecycleInput::Fail)?;
                            run.skip(&logical_id, STATE_UNAVAILABLE);
                            break;
                        }
                        let handle = in_flight.spawn(call_provider(provider.clone(), options.retry.clone(), run.events.clone(), job));
                        tasks.insert(handle.id(), logical_id);
                    }
                    Dispatch::Settled => queue.complete(&logical_id),
                    Dispatch::Failed => {
                        for blocked in queue.fail(&logical_id) {
                            run.skip(&blocked, format!("blocked by failure of '{logical_id}'"));
                        }
                    }
                }
            }
        }

        if in_flight.is_empty() {
            if !dispatching || !queue.has_ready() {
                break;
            }
            continue;
        }

        tokio::select! {
            joined = in_flight.join_next_with_id() => match joined {
                Some(Ok((id, outcome))) => {
                    tasks.remove(&id);
                    run.complete(&mut queue, outcome)?;
                }
                Some(Err(join_error)) => {
                    let logical_id = tasks.remove(&join_error.id()).unwrap_or_default();
                    let message = format!("worker for '{logical_id}' stopped: {join_error}");
                    warn!(resource = %logical_id, error = %message, "provisioning worker failed");
                    run.worker_error.get_or_insert(message.clone());
                    run.complete(
                        &mut queue,
                        TaskOutcome {
                            logical_id,
                            action: ResourceAction::Skip,
                            properties: None,
                            result: Err(ProviderError::fatal("WorkerFailed", message)),
                            attempts: 0,
                            duration: Duration::ZERO,
                        },
                    )?;
                }
                None => {}
            },
            _ = cancel.cancelled(), if dispatching => {}
        }
    }
    Ok(())
}

fn call_provider(
    provider: Arc<dyn CloudProvider>,
    retry: RetryPolicy,
    events: Option<UnboundedSender<RunEvent>>,
    job: Job,
) -> impl Future<Output = TaskOutcome> + Send + 'static {
    async move {
        let started = Instant::now();
        let logical_id = job.logical_id().to_string();
        let action = job.action();
        let properties = job.properties().cloned();
        let on_retry = |attempt: u32, delay: Duration, error: &ProviderError| {
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(resource = %logical_id, attempt, delay_ms, %error, "transient provider error; retrying");
            if let Some(events) = &events {
                let _ = events.send(RunEvent::ResourceRetrying {
                    logical_id: logical_id.clone(),
                    attempt,
                    delay_ms,
                    error: error.to_string(),
                });
            }
        };

        let Attempted { result, attempts } = match &job {
            Job::Create(request) => {
                with_retry(&retry, on_retry, || {
                    let provider = provider.clone();
                    let request = request.clone();
                    async move { provider.create(request).await.map(Some) }
                })
                .await
            }
            Job::Update(request) => {
                with_retry(&retry, on_retry, || {
                    let provider = provider.clone();
                    let request = request.clone();
                    async move { provider.update(request).await.map(Some) }
                })
                .await
            }
            Job::Delete(request) => {
                with_retry(&retry, on_retry, || {
                    let provider = provider.clone();
                    let request = request.clone();
                    async move { provider.delete(request).await.map(|()| None) }
                })
                .await
            }
        };

        TaskOutcome {
            logical_id,
            action,
            properties,
            result,
            attempts,
            duration: started.elapsed(),
        }
    }
}
