//! In-memory cloud provider.
//!
//! [`SimulatedProvider`] behaves like a small, strict resource API: it assigns
//! physical ids in the provider's formats, deduplicates creates by idempotency
//! token, refuses references to resources it does not know, and refuses to
//! delete resources other resources still point at. Faults can be scripted
//! per logical id and operation, and every call is recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::debug;
use uuid::Uuid;

use super::{CloudProvider, CreateRequest, DeleteRequest, ProviderError, ProvisionedResource, UpdateRequest};
use crate::catalog::{self, PhysicalIdFormat, ResourceKind};
use crate::resolve::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION};
use crate::state::StackState;

static PREFIXED_ID: Lazy<Regex> = Lazy::new(|| {
    let prefixes: Vec<&str> = catalog::supported_types()
        .filter_map(catalog::lookup)
        .filter_map(|kind| match kind.physical_id {
            PhysicalIdFormat::Prefixed(prefix) => Some(prefix),
            PhysicalIdFormat::Arn { .. } => None,
        })
        .collect();
    Regex::new(&format!("^(?:{})-[0-9a-f]{{17}}$", prefixes.join("|"))).expect("valid physical id pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOperation {
    Create,
    Read,
    Update,
    Delete,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub operation: ProviderOperation,
    /// Empty for reads, which only carry a physical id.
    pub logical_id: String,
    pub physical_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub read: usize,
    pub update: usize,
    pub delete: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.create + self.read + self.update + self.delete
    }
}

#[derive(Debug, Clone)]
struct SimulatedResource {
    logical_id: String,
    resource_type: String,
    properties: Map<String, Value>,
    attributes: IndexMap<String, Value>,
}

#[derive(Default)]
struct Inner {
    resources: IndexMap<String, SimulatedResource>,
    tokens: HashMap<String, String>,
    queued_faults: HashMap<(String, ProviderOperation), VecDeque<ProviderError>>,
    standing_faults: HashMap<(String, ProviderOperation), ProviderError>,
    calls: Vec<ProviderCall>,
    sequence: u64,
}

pub struct SimulatedProvider {
    region: String,
    account_id: String,
    latency: Duration,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(DEFAULT_REGION, DEFAULT_ACCOUNT_ID)
    }
}

impl SimulatedProvider {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            latency: Duration::ZERO,
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency` before it is served.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the resources recorded in a stack's state exist at this provider.
    pub fn seed(&self, state: &StackState) {
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        for (logical_id, record) in state.live_resources() {
            let Some(physical_id) = record.physical_id.clone() else { continue };
            if let Some(token) = &record.idempotency_token {
                inner.tokens.insert(token.clone(), physical_id.clone());
            }
            inner.resources.insert(
                physical_id,
                SimulatedResource {
                    logical_id: logical_id.clone(),
                    resource_type: record.resource_type.clone(),
                    properties: record.properties.clone(),
                    attributes: record.attributes.clone(),
                },
            );
        }
    }

    /// Queue one failure for the next `operation` on `logical_id`.
    pub fn fail_next(&self, logical_id: &str, operation: ProviderOperation, error: ProviderError) {
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        inner
            .queued_faults
            .entry((logical_id.to_string(), operation))
            .or_default()
            .push_back(error);
    }

    /// Throttle the next `times` calls of `operation` on `logical_id`.
    pub fn throttle(&self, logical_id: &str, operation: ProviderOperation, times: usize) {
        for _ in 0..times {
            self.fail_next(logical_id, operation, ProviderError::transient("Throttling", "Rate exceeded"));
        }
    }

    /// Fail every `operation` on `logical_id` until cleared.
    pub fn fail_always(&self, logical_id: &str, operation: ProviderOperation, error: ProviderError) {
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        inner.standing_faults.insert((logical_id.to_string(), operation), error);
    }

    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        inner.queued_faults.clear();
        inner.standing_faults.clear();
    }

    pub fn call_counts(&self) -> CallCounts {
        let inner = self.inner.lock().expect("provider lock poisoned");
        let mut counts = CallCounts::default();
        for call in &inner.calls {
            match call.operation {
                ProviderOperation::Create => counts.create += 1,
                ProviderOperation::Read => counts.read += 1,
                ProviderOperation::Update => counts.update += 1,
                ProviderOperation::Delete => counts.delete += 1,
            }
        }
        counts
    }

    /// Logical ids in the order `operation` was called on them.
    pub fn call_order(&self, operation: ProviderOperation) -> Vec<String> {
        let inner = self.inner.lock().expect("provider lock poisoned");
        inner
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .map(|call| call.logical_id.clone())
            .collect()
    }

    /// Number of resources that currently exist.
    pub fn resource_count(&self) -> usize {
        self.inner.lock().expect("provider lock poisoned").resources.len()
    }

    pub fn exists(&self, physical_id: &str) -> bool {
        self.inner.lock().expect("provider lock poisoned").resources.contains_key(physical_id)
    }

    /// Properties a resource currently has.
    pub fn properties_of(&self, physical_id: &str) -> Option<Map<String, Value>> {
        let inner = self.inner.lock().expect("provider lock poisoned");
        inner.resources.get(physical_id).map(|resource| resource.properties.clone())
    }

    /// Highest number of calls that were being served at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    fn physical_id_for(&self, kind: &ResourceKind, name: &str, suffix: &str) -> String {
        match kind.physical_id {
            PhysicalIdFormat::Prefixed(prefix) => format!("{prefix}-{}", &suffix[suffix.len() - 17..]),
            PhysicalIdFormat::Arn { service, resource } => format!(
                "arn:aws:{service}:{}:{}:{resource}/{name}/{}",
                self.region,
                self.account_id,
                &suffix[suffix.len() - 16..]
            ),
        }
    }

    fn is_managed_id(&self, candidate: &str) -> bool {
        PREFIXED_ID.is_match(candidate) || candidate.starts_with(&format!("arn:aws:elasticloadbalancing:{}:{}:", self.region, self.account_id))
    }

    fn check_references(&self, inner: &Inner, properties: &Map<String, Value>) -> Result<(), ProviderError> {
        let mut referenced = Vec::new();
        collect_strings(&Value::Object(properties.clone()), &mut referenced);
        for candidate in referenced {
            if self.is_managed_id(&candidate) && !inner.resources.contains_key(&candidate) {
                return Err(ProviderError::fatal(
                    "InvalidID.NotFound",
                    format!("the id '{candidate}' does not exist"),
                ));
            }
        }
        Ok(())
    }

    fn attributes_for(
        &self,
        kind: &ResourceKind,
        physical_id: &str,
        name: &str,
        sequence: u64,
        properties: &Map<String, Value>,
    ) -> IndexMap<String, Value> {
        let hex = physical_id.rsplit(['-', '/']).next().unwrap_or(physical_id).to_string();
        let zone = properties
            .get("AvailabilityZone")
            .cloned()
            .unwrap_or_else(|| Value::String(format!("{}a", self.region)));
        let octet_high = (sequence / 250) % 250;
        let octet_low = sequence % 250 + 4;

        let mut attributes = IndexMap::new();
        for attribute in kind.attributes {
            let identity = matches!(
                (kind.type_name, *attribute),
                ("AWS::EC2::VPC", "VpcId")
                    | (
                        _,
                        "SubnetId"
                            | "InternetGatewayId"
                            | "RouteTableId"
                            | "GroupId"
                            | "InstanceId"
                            | "Id"
                            | "LoadBalancerArn"
                            | "TargetGroupArn"
                            | "ListenerArn"
                    )
            );
            if identity {
                attributes.insert(attribute.to_string(), json!(physical_id));
                continue;
            }
            let value = match *attribute {
                "AvailabilityZone" => zone.clone(),
                "CidrBlockAssociations" => json!([format!("vpc-cidr-assoc-{hex}")]),
                "DefaultNetworkAcl" => json!(format!("acl-{hex}")),
                "DefaultSecurityGroup" => json!(format!("sg-{hex}")),
                "Ipv6CidrBlocks" | "LoadBalancerArns" => json!([]),
                "NetworkAclAssociationId" => json!(format!("aclassoc-{hex}")),
                "PrivateIp" => json!(format!("10.0.{octet_high}.{octet_low}")),
                "PrivateDnsName" => json!(format!(
                    "ip-10-0-{octet_high}-{octet_low}.{}.compute.internal",
                    self.region
                )),
                "PublicIp" => json!(format!("54.{octet_high}.{}.{octet_low}", sequence % 200 + 10)),
                "PublicDnsName" => json!(format!(
                    "ec2-54-{octet_high}-{}-{octet_low}.compute-1.amazonaws.com",
                    sequence % 200 + 10
                )),
                "CanonicalHostedZoneID" => json!("Z35SXDOTRQ7X7K"),
                "DNSName" => json!(format!("{name}-{}.{}.elb.amazonaws.com", sequence + 1_000_000, self.region)),
                "LoadBalancerFullName" => json!(format!("app/{name}/{hex}")),
                "TargetGroupFullName" => json!(format!("targetgroup/{name}/{hex}")),
                "LoadBalancerName" | "TargetGroupName" => json!(name),
                other => properties.get(other).cloned().unwrap_or(Value::Null),
            };
            attributes.insert(attribute.to_string(), value);
        }
        attributes
    }

    fn take_fault(inner: &mut Inner, logical_id: &str, operation: ProviderOperation) -> Option<ProviderError> {
        let key = (logical_id.to_string(), operation);
        if let Some(error) = inner.standing_faults.get(&key) {
            return Some(error.clone());
        }
        inner.queued_faults.get_mut(&key).and_then(VecDeque::pop_front)
    }
}

#[async_trait::async_trait]
impl CloudProvider for SimulatedProvider {
    async fn create(&self, request: CreateRequest) -> Result<ProvisionedResource, ProviderError> {
        let _in_flight = self.enter().await;
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Create,
            logical_id: request.logical_id.clone(),
            physical_id: None,
        });
        if let Some(error) = Self::take_fault(&mut inner, &request.logical_id, ProviderOperation::Create) {
            return Err(error);
        }

        if let Some(physical_id) = inner.tokens.get(&request.idempotency_token)
            && let Some(existing) = inner.resources.get(physical_id)
        {
            debug!(resource = %request.logical_id, physical_id = %physical_id, "create deduplicated by idempotency token");
            return Ok(ProvisionedResource {
                physical_id: physical_id.clone(),
                attributes: existing.attributes.clone(),
            });
        }

        let kind = catalog::lookup(&request.resource_type).ok_or_else(|| {
            ProviderError::fatal("UnsupportedResourceType", format!("type '{}' is not supported", request.resource_type))
        })?;
        if let Some(missing) = kind.required_properties.iter().find(|name| !request.properties.contains_key(**name)) {
            return Err(ProviderError::fatal("ValidationError", format!("property '{missing}' is required")));
        }
        self.check_references(&inner, &request.properties)?;

        inner.sequence += 1;
        let sequence = inner.sequence;
        let suffix = Uuid::now_v7().simple().to_string();
        let name = resource_name(&request.logical_id, &request.properties);
        let physical_id = self.physical_id_for(kind, &name, &suffix);
        let attributes = self.attributes_for(kind, &physical_id, &name, sequence, &request.properties);

        inner.tokens.insert(request.idempotency_token.clone(), physical_id.clone());
        inner.resources.insert(
            physical_id.clone(),
            SimulatedResource {
                logical_id: request.logical_id.clone(),
                resource_type: request.resource_type.clone(),
                properties: request.properties,
                attributes: attributes.clone(),
            },
        );
        if let Some(call) = inner.calls.last_mut() {
            call.physical_id = Some(physical_id.clone());
        }
        Ok(ProvisionedResource { physical_id, attributes })
    }

    async fn read(&self, resource_type: &str, physical_id: &str) -> Result<Option<ProvisionedResource>, ProviderError> {
        let _in_flight = self.enter().await;
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        let logical_id = inner
            .resources
            .get(physical_id)
            .map(|resource| resource.logical_id.clone())
            .unwrap_or_default();
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Read,
            logical_id,
            physical_id: Some(physical_id.to_string()),
        });
        Ok(inner
            .resources
            .get(physical_id)
            .filter(|resource| resource.resource_type == resource_type)
            .map(|resource| ProvisionedResource {
                physical_id: physical_id.to_string(),
                attributes: resource.attributes.clone(),
            }))
    }

    async fn update(&self, request: UpdateRequest) -> Result<ProvisionedResource, ProviderError> {
        let _in_flight = self.enter().await;
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Update,
            logical_id: request.logical_id.clone(),
            physical_id: Some(request.physical_id.clone()),
        });
        if let Some(error) = Self::take_fault(&mut inner, &request.logical_id, ProviderOperation::Update) {
            return Err(error);
        }

        let kind = catalog::lookup(&request.resource_type).ok_or_else(|| {
            ProviderError::fatal("UnsupportedResourceType", format!("type '{}' is not supported", request.resource_type))
        })?;
        if !inner.resources.contains_key(&request.physical_id) {
            return Err(ProviderError::fatal(
                "InvalidID.NotFound",
                format!("the id '{}' does not exist", request.physical_id),
            ));
        }
        self.check_references(&inner, &request.properties)?;

        inner.sequence += 1;
        let sequence = inner.sequence;
        let name = resource_name(&request.logical_id, &request.properties);
        let attributes = self.attributes_for(kind, &request.physical_id, &name, sequence, &request.properties);
        if let Some(resource) = inner.resources.get_mut(&request.physical_id) {
            resource.properties = request.properties;
            resource.attributes = attributes.clone();
        }
        Ok(ProvisionedResource {
            physical_id: request.physical_id,
            attributes,
        })
    }

    async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError> {
        let _in_flight = self.enter().await;
        let mut inner = self.inner.lock().expect("provider lock poisoned");
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Delete,
            logical_id: request.logical_id.clone(),
            physical_id: Some(request.physical_id.clone()),
        });
        if let Some(error) = Self::take_fault(&mut inner, &request.logical_id, ProviderOperation::Delete) {
            return Err(error);
        }
        if !inner.resources.contains_key(&request.physical_id) {
            return Ok(());
        }

        let dependent = inner.resources.iter().find_map(|(physical_id, resource)| {
            let mut strings = Vec::new();
            collect_strings(&Value::Object(resource.properties.clone()), &mut strings);
            (physical_id != &request.physical_id && strings.contains(&request.physical_id)).then(|| resource.logical_id.clone())
        });
        if let Some(dependent) = dependent {
            return Err(ProviderError::transient(
                "DependencyViolation",
                format!("resource '{}' has a dependent object ({dependent})", request.physical_id),
            ));
        }

        inner.resources.shift_remove(&request.physical_id);
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Name used in ARNs and DNS names: the `Name` property, else the logical id.
fn resource_name(logical_id: &str, properties: &Map<String, Value>) -> String {
    let base = properties
        .get("Name")
        .and_then(Value::as_str)
        .unwrap_or(logical_id)
        .to_ascii_lowercase();
    let cleaned: String = base.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').take(32).collect();
    if cleaned.is_empty() { "resource".into() } else { cleaned }
}

fn collect_strings(value: &Value, into: &mut Vec<String>) {
    match value {
        Value::String(text) => into.push(text.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, into)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, into)),
        _ => {}
    }
}
