//! In-memory provider
//!
//! Backs the test suites and `agentstack install --dry-run`. Resources live in
//! a map keyed by (kind, name), identifiers are deterministic
//! (`vpc-0001`, `subnet-0002`, ...) and every call is recorded so tests can
//! assert on call counts and ordering.

use crate::error::{CloudError, Result};
use crate::provider::{
    AuthStatus, CloudProvider, Invocation, NetworkSnapshot, RemoteShell, RouteInfo,
    RouteTableInfo, SubnetInfo,
};
use crate::resource::{ResourceDescriptor, ResourceKind, ResourceStatus, attr};
use crate::spec::{IngressRule, ResourceSpec, RouteTarget, Setting};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

const ACCOUNT_ID: &str = "123456789012";

/// Instance states `find` still reports
const LIVE_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];

/// Operation recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOp {
    CheckAuth,
    Find,
    Create,
    Apply,
    Status,
    ExistingCidrs,
    AvailabilityZones,
    NetworkSnapshot,
    LatestImage,
    Discover,
    Release,
    DetachReferences,
    Delete,
    SendScript,
}

/// One recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: CallOp,
    pub kind: Option<ResourceKind>,
    pub name: String,
}

#[derive(Default)]
struct Inner {
    resources: BTreeMap<(ResourceKind, String), ResourceDescriptor>,
    sequence: HashMap<ResourceKind, u32>,
    calls: Vec<Call>,
    applied: Vec<Setting>,
    route_tables: BTreeMap<String, (String, RouteTableInfo)>,
    throttles: HashMap<ResourceKind, u32>,
    discover_throttles: HashMap<ResourceKind, u32>,
    rejected_blocks: HashSet<String>,
    conflicts: HashSet<ResourceKind>,
    blocked: HashSet<String>,
    statuses: HashMap<ResourceKind, VecDeque<String>>,
    preexisting_cidrs: Vec<String>,
    images: Vec<(String, String)>,
    commands: u32,
}

impl Inner {
    fn record(&mut self, op: CallOp, kind: Option<ResourceKind>, name: impl Into<String>) {
        self.calls.push(Call {
            op,
            kind,
            name: name.into(),
        });
    }

    fn next_id(&mut self, kind: ResourceKind) -> String {
        let counter = self.sequence.entry(kind).or_insert(0);
        *counter += 1;
        format!("{}-{:04}", kind.id_prefix(), counter)
    }

    fn by_id(&self, kind: ResourceKind, id: &str) -> Option<&ResourceDescriptor> {
        self.resources
            .values()
            .find(|d| d.kind == kind && answers_to(d, id))
    }

    fn by_id_mut(&mut self, kind: ResourceKind, id: &str) -> Option<&mut ResourceDescriptor> {
        self.resources
            .values_mut()
            .find(|d| d.kind == kind && answers_to(d, id))
    }

    fn is_live(descriptor: &ResourceDescriptor) -> bool {
        descriptor.kind != ResourceKind::Instance
            || descriptor
                .attr_str(attr::STATE)
                .is_none_or(|state| LIVE_STATES.contains(&state))
    }

    fn key_of(&self, target: &ResourceDescriptor) -> Option<(ResourceKind, String)> {
        let key = (target.kind, target.name.clone());
        if self.resources.contains_key(&key) {
            return Some(key);
        }
        let id = target.identifier()?;
        self.by_id(target.kind, id).map(|d| (d.kind, d.name.clone()))
    }
}

/// In-memory [`CloudProvider`] with fault injection
pub struct MemoryProvider {
    region: String,
    inner: Mutex<Inner>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_region("us-west-2")
    }

    pub fn with_region(region: impl Into<String>) -> Self {
        let inner = Inner {
            images: vec![
                ("al2023-ami-ecs-hvm-2023.0.20250101-x86_64".into(), "ami-0ecs0001".into()),
                ("al2023-ami-2023.6.20250101.0-kernel-6.1-x86_64".into(), "ami-0std0001".into()),
            ],
            ..Default::default()
        };
        Self {
            region: region.into(),
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens inside a failing test
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- fault injection ----

    /// Fail the next `times` creates of `kind` with a throttling error
    pub fn throttle_next_creates(&self, kind: ResourceKind, times: u32) {
        self.lock().throttles.insert(kind, times);
    }

    /// Fail the next `times` listings of `kind` with a throttling error
    pub fn throttle_next_discovers(&self, kind: ResourceKind, times: u32) {
        self.lock().discover_throttles.insert(kind, times);
    }

    /// Subnet creates asking for `cidr` fail as if the block conflicted with
    /// another subnet
    pub fn reject_subnet_block(&self, cidr: impl Into<String>) {
        self.lock().rejected_blocks.insert(cidr.into());
    }

    /// Simulate a concurrent creation: the next create of `kind` stores the
    /// resource and then reports a conflict
    pub fn conflict_on_next_create(&self, kind: ResourceKind) {
        self.lock().conflicts.insert(kind);
    }

    /// Every delete of the named resource fails with a dependency violation
    pub fn block_delete(&self, name: impl Into<String>) {
        self.lock().blocked.insert(name.into());
    }

    pub fn unblock_delete(&self, name: &str) {
        self.lock().blocked.remove(name);
    }

    /// Statuses returned by the next `status` calls for `kind`
    pub fn script_status(&self, kind: ResourceKind, statuses: &[&str]) {
        self.lock()
            .statuses
            .insert(kind, statuses.iter().map(|s| s.to_string()).collect());
    }

    /// CIDR blocks of networks that exist outside this provider's records
    pub fn with_existing_cidrs(self, cidrs: &[&str]) -> Self {
        self.lock().preexisting_cidrs = cidrs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Seed a resource as if an earlier run had created it
    pub fn insert(&self, descriptor: ResourceDescriptor) {
        self.lock()
            .resources
            .insert((descriptor.kind, descriptor.name.clone()), descriptor);
    }

    // ---- inspection ----

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: CallOp, kind: ResourceKind) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.kind == Some(kind))
            .count()
    }

    /// Index of the first matching call in the log
    pub fn position(&self, op: CallOp, kind: ResourceKind) -> Option<usize> {
        self.lock()
            .calls
            .iter()
            .position(|c| c.op == op && c.kind == Some(kind))
    }

    pub fn applied(&self) -> Vec<Setting> {
        self.lock().applied.clone()
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<ResourceDescriptor> {
        self.lock().resources.get(&(kind, name.to_string())).cloned()
    }

    pub fn resources_of(&self, kind: ResourceKind) -> Vec<ResourceDescriptor> {
        self.lock()
            .resources
            .values()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    fn build(&self, inner: &mut Inner, spec: &ResourceSpec) -> ResourceDescriptor {
        let kind = spec.kind();
        let id = inner.next_id(kind);
        let region = &self.region;
        let base = ResourceDescriptor::new(kind, spec.name())
            .with_id(id.clone())
            .with_tag("Name", spec.name());

        match spec {
            ResourceSpec::Bucket { name } => base
                .with_id(name.clone())
                .with_arn(format!("arn:aws:s3:::{}", name))
                .with_status(ResourceStatus::Available),
            ResourceSpec::Role { name, .. } => base
                .with_arn(format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, name))
                .with_status(ResourceStatus::Available),
            ResourceSpec::InstanceProfile { name } => base
                .with_arn(format!("arn:aws:iam::{}:instance-profile/{}", ACCOUNT_ID, name))
                .with_status(ResourceStatus::Available),
            ResourceSpec::Secret { name, .. } => base
                .with_arn(format!(
                    "arn:aws:secretsmanager:{}:{}:secret:{}-{}",
                    region, ACCOUNT_ID, name, id
                ))
                .with_status(ResourceStatus::Available),
            ResourceSpec::SecurityPolicy { .. } => base.with_status(ResourceStatus::Active),
            ResourceSpec::AccessPolicy { .. } => base
                .with_attribute(attr::PRINCIPALS, json!([]))
                .with_status(ResourceStatus::Active),
            ResourceSpec::Collection { .. } => base
                .with_arn(format!(
                    "arn:aws:aoss:{}:{}:collection/{}",
                    region, ACCOUNT_ID, id
                ))
                .with_attribute(
                    attr::ENDPOINT,
                    json!(format!("https://{}.{}.aoss.amazonaws.com", id, region)),
                )
                .with_status(ResourceStatus::Pending),
            ResourceSpec::VectorIndex { .. } => base.with_status(ResourceStatus::Active),
            ResourceSpec::KnowledgeBase { collection_arn, .. } => base
                .with_arn(format!(
                    "arn:aws:bedrock:{}:{}:knowledge-base/{}",
                    region, ACCOUNT_ID, id
                ))
                .with_attribute(attr::COLLECTION_ARN, json!(collection_arn))
                .with_status(ResourceStatus::Pending),
            ResourceSpec::DataSource {
                knowledge_base_id, ..
            } => base
                .with_attribute(attr::KNOWLEDGE_BASE_ID, json!(knowledge_base_id))
                .with_status(ResourceStatus::Available),
            ResourceSpec::Vpc { cidr, .. } => {
                let main = inner.next_id(ResourceKind::RouteTable);
                inner.route_tables.insert(
                    main.clone(),
                    (
                        id.clone(),
                        RouteTableInfo {
                            id: main,
                            main: true,
                            subnet_ids: vec![],
                            routes: vec![],
                        },
                    ),
                );
                base.with_attribute(attr::CIDR, json!(cidr))
                    .with_attribute(attr::IS_DEFAULT, json!(false))
                    .with_status(ResourceStatus::Available)
            }
            ResourceSpec::Subnet {
                vpc_id,
                cidr,
                availability_zone,
                public,
                ..
            } => base
                .with_attribute(attr::VPC_ID, json!(vpc_id))
                .with_attribute(attr::CIDR, json!(cidr))
                .with_attribute(attr::AVAILABILITY_ZONE, json!(availability_zone))
                .with_tag(
                    "aws-cdk:subnet-type",
                    if *public { "Public" } else { "Private" },
                )
                .with_status(ResourceStatus::Available),
            ResourceSpec::InternetGateway { vpc_id, .. } => base
                .with_attribute(attr::VPC_ID, json!(vpc_id))
                .with_status(ResourceStatus::Available),
            ResourceSpec::NatGateway { subnet_id, .. } => base
                .with_attribute(attr::SUBNET_ID, json!(subnet_id))
                .with_status(ResourceStatus::Pending),
            ResourceSpec::RouteTable { vpc_id, .. } => {
                inner.route_tables.insert(
                    id.clone(),
                    (
                        vpc_id.clone(),
                        RouteTableInfo {
                            id: id.clone(),
                            main: false,
                            subnet_ids: vec![],
                            routes: vec![],
                        },
                    ),
                );
                base.with_attribute(attr::VPC_ID, json!(vpc_id))
                    .with_status(ResourceStatus::Available)
            }
            ResourceSpec::SecurityGroup {
                vpc_id, ingress, ..
            } => base
                .with_attribute(attr::VPC_ID, json!(vpc_id))
                .with_attribute(attr::INGRESS, json!(ingress))
                .with_status(ResourceStatus::Available),
            ResourceSpec::VpcEndpoint { vpc_id, .. } => base
                .with_attribute(attr::VPC_ID, json!(vpc_id))
                .with_status(ResourceStatus::Available),
            ResourceSpec::LoadBalancer { name, .. } => base
                .with_arn(format!(
                    "arn:aws:elasticloadbalancing:{}:{}:loadbalancer/app/{}/{}",
                    region, ACCOUNT_ID, name, id
                ))
                .with_attribute(
                    attr::DNS_NAME,
                    json!(format!("{}-{}.{}.elb.amazonaws.com", name, id, region)),
                )
                .with_status(ResourceStatus::Active),
            ResourceSpec::TargetGroup { name, vpc_id, .. } => base
                .with_arn(format!(
                    "arn:aws:elasticloadbalancing:{}:{}:targetgroup/{}/{}",
                    region, ACCOUNT_ID, name, id
                ))
                .with_attribute(attr::VPC_ID, json!(vpc_id))
                .with_status(ResourceStatus::Available),
            ResourceSpec::Listener { .. } => base
                .with_arn(format!(
                    "arn:aws:elasticloadbalancing:{}:{}:listener/app/{}",
                    region, ACCOUNT_ID, id
                ))
                .with_status(ResourceStatus::Available),
            ResourceSpec::ListenerRule { .. } => base
                .with_arn(format!(
                    "arn:aws:elasticloadbalancing:{}:{}:listener-rule/app/{}",
                    region, ACCOUNT_ID, id
                ))
                .with_status(ResourceStatus::Available),
            ResourceSpec::OriginAccessIdentity { .. } => {
                base.with_status(ResourceStatus::Available)
            }
            ResourceSpec::Distribution { .. } => base
                .with_attribute(attr::DOMAIN_NAME, json!(format!("{}.cloudfront.net", id)))
                .with_attribute(attr::ENABLED, json!(true))
                .with_status(ResourceStatus::Pending),
            ResourceSpec::Instance { subnet_id, .. } => base
                .with_attribute(attr::SUBNET_ID, json!(subnet_id))
                .with_attribute(attr::STATE, json!("pending"))
                .with_attribute(attr::PRIVATE_IP, json!("10.0.2.15"))
                .with_status(ResourceStatus::Pending),
        }
    }

    fn default_status(descriptor: &ResourceDescriptor) -> String {
        match descriptor.kind {
            ResourceKind::Collection | ResourceKind::KnowledgeBase => "ACTIVE".to_string(),
            ResourceKind::Instance => "running".to_string(),
            ResourceKind::Distribution => "Deployed".to_string(),
            _ => "available".to_string(),
        }
    }
}

fn answers_to(descriptor: &ResourceDescriptor, id: &str) -> bool {
    descriptor.id.as_deref() == Some(id) || descriptor.arn.as_deref() == Some(id)
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || parts.last().is_none_or(|last| text.ends_with(last))
}

fn referencing_rules(rules: &[IngressRule], groups: &HashSet<String>) -> usize {
    rules
        .iter()
        .filter(|r| r.source_group.as_ref().is_some_and(|g| groups.contains(g)))
        .count()
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        self.lock().record(CallOp::CheckAuth, None, "");
        Ok(AuthStatus::ok(
            ACCOUNT_ID,
            format!("arn:aws:iam::{}:user/dry-run", ACCOUNT_ID),
        ))
    }

    async fn find(&self, kind: ResourceKind, name: &str) -> Result<Option<ResourceDescriptor>> {
        let mut inner = self.lock();
        inner.record(CallOp::Find, Some(kind), name);
        Ok(inner
            .resources
            .get(&(kind, name.to_string()))
            .filter(|d| Inner::is_live(d))
            .cloned())
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceDescriptor> {
        let kind = spec.kind();
        let name = spec.name().to_string();
        let mut inner = self.lock();
        inner.record(CallOp::Create, Some(kind), name.clone());

        if let Some(remaining) = inner.throttles.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CloudError::Throttled(format!("create {} {}", kind, name)));
            }
        }

        if let ResourceSpec::Subnet { cidr, .. } = spec {
            if inner.rejected_blocks.contains(cidr) {
                return Err(CloudError::ApiError(format!(
                    "InvalidSubnet.Conflict: The CIDR '{}' conflicts with another subnet",
                    cidr
                )));
            }
        }

        // A terminated instance keeps its name until it is purged
        let existing = inner.resources.get(&(kind, name.clone()));
        if existing.is_some_and(Inner::is_live) {
            return Err(CloudError::AlreadyExists(format!("{} {}", kind, name)));
        }

        let descriptor = self.build(&mut inner, spec);
        inner
            .resources
            .insert((kind, name.clone()), descriptor.clone());

        if inner.conflicts.remove(&kind) {
            return Err(CloudError::AlreadyExists(format!(
                "{} {} was created concurrently",
                kind, name
            )));
        }

        Ok(descriptor)
    }

    async fn apply(&self, setting: &Setting) -> Result<()> {
        let mut inner = self.lock();
        let (kind, name) = match setting {
            Setting::BucketDefaults { bucket } | Setting::BucketPolicy { bucket, .. } => {
                (ResourceKind::Bucket, bucket.clone())
            }
            Setting::RoleInlinePolicy { role, .. } | Setting::RoleManagedPolicy { role, .. } => {
                (ResourceKind::Role, role.clone())
            }
            Setting::InstanceProfileRole { profile, .. } => {
                (ResourceKind::InstanceProfile, profile.clone())
            }
            Setting::AccessPolicyPrincipals { policy, .. } => {
                (ResourceKind::AccessPolicy, policy.clone())
            }
            Setting::VpcDnsSupport { vpc_id } => (ResourceKind::Vpc, vpc_id.clone()),
            Setting::SubnetPublicIp { subnet_id } => (ResourceKind::Subnet, subnet_id.clone()),
            Setting::Route { route_table_id, .. }
            | Setting::RouteTableAssociation { route_table_id, .. } => {
                (ResourceKind::RouteTable, route_table_id.clone())
            }
            Setting::TargetRegistration {
                target_group_arn, ..
            } => (ResourceKind::TargetGroup, target_group_arn.clone()),
            Setting::EnableDistribution { distribution_id } => {
                (ResourceKind::Distribution, distribution_id.clone())
            }
        };
        inner.record(CallOp::Apply, Some(kind), name);

        match setting {
            Setting::Route {
                route_table_id,
                destination,
                target,
            } => {
                let (_, table) = inner
                    .route_tables
                    .get_mut(route_table_id)
                    .ok_or_else(|| CloudError::NotFound(route_table_id.clone()))?;
                if !table.routes.iter().any(|r| &r.destination == destination) {
                    let (gateway_id, nat_gateway_id) = match target {
                        RouteTarget::InternetGateway(id) => (Some(id.clone()), None),
                        RouteTarget::NatGateway(id) => (None, Some(id.clone())),
                    };
                    table.routes.push(RouteInfo {
                        destination: destination.clone(),
                        gateway_id,
                        nat_gateway_id,
                    });
                }
            }
            Setting::RouteTableAssociation {
                route_table_id,
                subnet_id,
            } => {
                for (_, table) in inner.route_tables.values_mut() {
                    table.subnet_ids.retain(|s| s != subnet_id);
                }
                let (_, table) = inner
                    .route_tables
                    .get_mut(route_table_id)
                    .ok_or_else(|| CloudError::NotFound(route_table_id.clone()))?;
                table.subnet_ids.push(subnet_id.clone());
            }
            Setting::AccessPolicyPrincipals { policy, principals } => {
                if let Some(descriptor) = inner
                    .resources
                    .get_mut(&(ResourceKind::AccessPolicy, policy.clone()))
                {
                    let mut current: Vec<String> =
                        descriptor.attribute(attr::PRINCIPALS).unwrap_or_default();
                    for principal in principals {
                        if !current.contains(principal) {
                            current.push(principal.clone());
                        }
                    }
                    descriptor.set_attribute(attr::PRINCIPALS, json!(current));
                }
            }
            Setting::EnableDistribution { distribution_id } => {
                let descriptor = inner
                    .by_id_mut(ResourceKind::Distribution, distribution_id)
                    .ok_or_else(|| CloudError::NotFound(distribution_id.clone()))?;
                descriptor.set_attribute(attr::ENABLED, json!(true));
                descriptor.status = ResourceStatus::Pending;
            }
            _ => {}
        }

        inner.applied.push(setting.clone());
        Ok(())
    }

    async fn status(&self, kind: ResourceKind, id: &str) -> Result<String> {
        let mut inner = self.lock();
        inner.record(CallOp::Status, Some(kind), id);

        let scripted = inner.statuses.get_mut(&kind).and_then(|q| q.pop_front());
        let descriptor = inner
            .by_id(kind, id)
            .ok_or_else(|| CloudError::NotFound(format!("{} {}", kind, id)))?;
        let status = scripted.unwrap_or_else(|| Self::default_status(descriptor));

        if let Some(descriptor) = inner.by_id_mut(kind, id) {
            descriptor.status = ResourceStatus::parse(&status);
            if kind == ResourceKind::Instance {
                descriptor.set_attribute(attr::STATE, json!(status));
            }
        }
        Ok(status)
    }

    async fn existing_cidrs(&self) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.record(CallOp::ExistingCidrs, Some(ResourceKind::Vpc), "");
        let mut cidrs = inner.preexisting_cidrs.clone();
        cidrs.extend(
            inner
                .resources
                .values()
                .filter(|d| d.kind == ResourceKind::Vpc)
                .filter_map(|d| d.attr_str(attr::CIDR).map(str::to_string)),
        );
        Ok(cidrs)
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        self.lock()
            .record(CallOp::AvailabilityZones, Some(ResourceKind::Subnet), "");
        Ok(["a", "b", "c"]
            .iter()
            .map(|suffix| format!("{}{}", self.region, suffix))
            .collect())
    }

    async fn network_snapshot(&self, vpc_id: &str) -> Result<NetworkSnapshot> {
        let mut inner = self.lock();
        inner.record(CallOp::NetworkSnapshot, Some(ResourceKind::Vpc), vpc_id);

        let subnets = inner
            .resources
            .values()
            .filter(|d| d.kind == ResourceKind::Subnet && d.attr_str(attr::VPC_ID) == Some(vpc_id))
            .map(|d| SubnetInfo {
                id: d.id_or_name().to_string(),
                name: d.tags.get("Name").cloned().unwrap_or_default(),
                cidr: d.attr_str(attr::CIDR).unwrap_or_default().to_string(),
                availability_zone: d
                    .attr_str(attr::AVAILABILITY_ZONE)
                    .unwrap_or_default()
                    .to_string(),
                state: "available".to_string(),
                map_public_ip: false,
                tags: d.tags.clone(),
            })
            .collect();
        let route_tables = inner
            .route_tables
            .values()
            .filter(|(owner, _)| owner == vpc_id)
            .map(|(_, table)| table.clone())
            .collect();

        Ok(NetworkSnapshot {
            subnets,
            route_tables,
        })
    }

    async fn latest_image(&self, name_patterns: &[&str]) -> Result<Option<String>> {
        let mut inner = self.lock();
        inner.record(
            CallOp::LatestImage,
            Some(ResourceKind::Instance),
            name_patterns.join(","),
        );
        for pattern in name_patterns {
            if let Some((_, id)) = inner
                .images
                .iter()
                .find(|(name, _)| wildcard_match(pattern, name))
            {
                return Ok(Some(id.clone()));
            }
        }
        Ok(None)
    }

    async fn discover(&self, kind: ResourceKind, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
        let mut inner = self.lock();
        inner.record(CallOp::Discover, Some(kind), pattern);

        if let Some(remaining) = inner.discover_throttles.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CloudError::Throttled(format!("list {}", kind)));
            }
        }

        Ok(inner
            .resources
            .values()
            .filter(|d| d.kind == kind)
            .filter(|d| d.name.contains(pattern) || d.tags.values().any(|v| v.contains(pattern)))
            .cloned()
            .collect())
    }

    async fn release(&self, target: &ResourceDescriptor) -> Result<()> {
        let mut inner = self.lock();
        inner.record(CallOp::Release, Some(target.kind), target.name.clone());

        let Some(key) = inner.key_of(target) else {
            return Err(CloudError::NotFound(target.label()));
        };
        let id = inner
            .resources
            .get(&key)
            .map(|d| d.id_or_name().to_string())
            .unwrap_or_default();

        match target.kind {
            ResourceKind::Distribution => {
                if let Some(d) = inner.resources.get_mut(&key) {
                    d.set_attribute(attr::ENABLED, json!(false));
                    d.status = ResourceStatus::Disabled;
                }
            }
            ResourceKind::NatGateway => {
                for (_, table) in inner.route_tables.values_mut() {
                    table
                        .routes
                        .retain(|r| r.nat_gateway_id.as_deref() != Some(id.as_str()));
                }
            }
            ResourceKind::RouteTable => {
                if let Some((_, table)) = inner.route_tables.get_mut(&id) {
                    table.subnet_ids.clear();
                }
            }
            ResourceKind::Vpc => {
                inner.resources.retain(|(kind, _), d| {
                    !(matches!(kind, ResourceKind::Subnet | ResourceKind::InternetGateway)
                        && d.attr_str(attr::VPC_ID) == Some(id.as_str()))
                });
            }
            ResourceKind::SecurityGroup => {
                if let Some(d) = inner.resources.get_mut(&key) {
                    d.set_attribute(attr::INGRESS, json!([]));
                }
            }
            ResourceKind::KnowledgeBase => {
                inner.resources.retain(|(kind, _), d| {
                    !(*kind == ResourceKind::DataSource
                        && d.attr_str(attr::KNOWLEDGE_BASE_ID) == Some(id.as_str()))
                });
            }
            _ => {}
        }
        Ok(())
    }

    async fn detach_references(&self, groups: &[ResourceDescriptor]) -> Result<usize> {
        let mut inner = self.lock();
        inner.record(
            CallOp::DetachReferences,
            Some(ResourceKind::SecurityGroup),
            format!("{} groups", groups.len()),
        );

        let ids: HashSet<String> = groups
            .iter()
            .filter_map(|g| g.id.clone())
            .collect();
        let mut removed = 0;
        for descriptor in inner.resources.values_mut() {
            if descriptor.kind != ResourceKind::SecurityGroup {
                continue;
            }
            let rules: Vec<IngressRule> = descriptor.attribute(attr::INGRESS).unwrap_or_default();
            let count = referencing_rules(&rules, &ids);
            if count > 0 {
                let kept: Vec<IngressRule> = rules
                    .into_iter()
                    .filter(|r| !r.source_group.as_ref().is_some_and(|g| ids.contains(g)))
                    .collect();
                descriptor.set_attribute(attr::INGRESS, json!(kept));
                removed += count;
            }
        }
        Ok(removed)
    }

    async fn delete(&self, target: &ResourceDescriptor) -> Result<()> {
        let mut inner = self.lock();
        inner.record(CallOp::Delete, Some(target.kind), target.name.clone());

        if inner.blocked.contains(&target.name) {
            return Err(CloudError::DependencyViolation(format!(
                "{} has dependent objects",
                target.label()
            )));
        }

        let Some(key) = inner.key_of(target) else {
            return Err(CloudError::NotFound(target.label()));
        };
        if let Some(removed) = inner.resources.remove(&key) {
            let id = removed.id_or_name().to_string();
            match removed.kind {
                ResourceKind::Vpc => inner.route_tables.retain(|_, (owner, _)| owner != &id),
                ResourceKind::RouteTable => {
                    inner.route_tables.remove(&id);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for MemoryProvider {
    async fn is_managed(&self, instance_id: &str) -> Result<bool> {
        let inner = self.lock();
        Ok(inner.by_id(ResourceKind::Instance, instance_id).is_some())
    }

    async fn send_script(
        &self,
        instance_id: &str,
        _script: &str,
        _comment: &str,
    ) -> Result<String> {
        let mut inner = self.lock();
        inner.record(CallOp::SendScript, Some(ResourceKind::Instance), instance_id);
        inner.commands += 1;
        Ok(format!("cmd-{:04}", inner.commands))
    }

    async fn invocation(&self, _command_id: &str, _instance_id: &str) -> Result<Invocation> {
        Ok(Invocation {
            status: "Success".to_string(),
            stdout: "Setup completed successfully".to_string(),
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match(
            "al2023-ami-ecs-hvm-2023*-x86_64",
            "al2023-ami-ecs-hvm-2023.0.20250101-x86_64"
        ));
        assert!(!wildcard_match(
            "al2023-ami-ecs-hvm-2023*-x86_64",
            "al2023-ami-2023.6.20250101.0-kernel-6.1-x86_64"
        ));
        assert!(wildcard_match("al2023-ami-2023*", "al2023-ami-2023.6-x86_64"));
    }

    #[tokio::test]
    async fn test_deterministic_ids() {
        let provider = MemoryProvider::new();
        let first = provider
            .create(&ResourceSpec::Vpc {
                name: "vpc-a".into(),
                cidr: "10.20.0.0/16".into(),
            })
            .await
            .unwrap();
        let second = provider
            .create(&ResourceSpec::Vpc {
                name: "vpc-b".into(),
                cidr: "10.21.0.0/16".into(),
            })
            .await
            .unwrap();
        assert_eq!(first.id.as_deref(), Some("vpc-0001"));
        assert_eq!(second.id.as_deref(), Some("vpc-0002"));
        assert_eq!(
            provider.existing_cidrs().await.unwrap(),
            vec!["10.20.0.0/16".to_string(), "10.21.0.0/16".to_string()]
        );
    }

    #[tokio::test]
    async fn test_scripted_status() {
        let provider = MemoryProvider::new();
        let collection = provider
            .create(&ResourceSpec::Collection {
                name: "demo".into(),
                description: String::new(),
            })
            .await
            .unwrap();
        provider.script_status(ResourceKind::Collection, &["CREATING"]);
        let id = collection.id.unwrap();

        assert_eq!(
            provider.status(ResourceKind::Collection, &id).await.unwrap(),
            "CREATING"
        );
        assert_eq!(
            provider.status(ResourceKind::Collection, &id).await.unwrap(),
            "ACTIVE"
        );
    }

    fn instance_spec(name: &str) -> ResourceSpec {
        ResourceSpec::Instance {
            name: name.into(),
            image_id: "ami-0ecs0001".into(),
            instance_type: "t3.small".into(),
            subnet_id: "subnet-0001".into(),
            security_group_ids: vec![],
            instance_profile: "profile".into(),
            volume_size_gb: 30,
            user_data: String::new(),
        }
    }

    #[tokio::test]
    async fn test_terminated_instances_are_not_found() {
        let provider = MemoryProvider::new();
        let instance = provider.create(&instance_spec("ec2-demo")).await.unwrap();
        let id = instance.id.unwrap();

        let found = provider.find(ResourceKind::Instance, "ec2-demo").await.unwrap();
        assert!(found.is_some());

        provider.script_status(ResourceKind::Instance, &["terminated"]);
        provider.status(ResourceKind::Instance, &id).await.unwrap();
        let found = provider.find(ResourceKind::Instance, "ec2-demo").await.unwrap();
        assert!(found.is_none());

        // The name is free again
        let replacement = provider.create(&instance_spec("ec2-demo")).await.unwrap();
        assert_ne!(replacement.id.unwrap(), id);
    }

    #[tokio::test]
    async fn test_throttled_discover() {
        let provider = MemoryProvider::new();
        provider.throttle_next_discovers(ResourceKind::Vpc, 1);

        let err = provider.discover(ResourceKind::Vpc, "demo").await.unwrap_err();
        assert!(matches!(err, CloudError::Throttled(_)));
        assert!(provider.discover(ResourceKind::Vpc, "demo").await.unwrap().is_empty());
        assert_eq!(provider.count(CallOp::Discover, ResourceKind::Vpc), 2);
    }

    #[tokio::test]
    async fn test_rejected_subnet_block() {
        let provider = MemoryProvider::new();
        provider.reject_subnet_block("10.20.3.0/24");
        let spec = |cidr: &str| ResourceSpec::Subnet {
            name: format!("subnet-{}", cidr),
            vpc_id: "vpc-0001".into(),
            cidr: cidr.into(),
            availability_zone: "us-west-2b".into(),
            public: false,
        };

        let err = provider.create(&spec("10.20.3.0/24")).await.unwrap_err();
        assert!(err.to_string().contains("InvalidSubnet.Conflict"));
        assert!(provider.create(&spec("10.20.4.0/24")).await.is_ok());
    }

    #[tokio::test]
    async fn test_routes_show_in_snapshot() {
        let provider = MemoryProvider::new();
        let vpc = provider
            .create(&ResourceSpec::Vpc {
                name: "vpc".into(),
                cidr: "10.20.0.0/16".into(),
            })
            .await
            .unwrap();
        let vpc_id = vpc.id.unwrap();
        let snapshot = provider.network_snapshot(&vpc_id).await.unwrap();
        let main = snapshot.main_route_table().unwrap().id.clone();

        provider
            .apply(&Setting::Route {
                route_table_id: main.clone(),
                destination: "0.0.0.0/0".into(),
                target: RouteTarget::InternetGateway("igw-0001".into()),
            })
            .await
            .unwrap();

        let snapshot = provider.network_snapshot(&vpc_id).await.unwrap();
        assert!(snapshot.main_route_table().unwrap().has_default_internet_route());
    }

    #[tokio::test]
    async fn test_detach_references_counts_rules() {
        let provider = MemoryProvider::new();
        let alb_sg = provider
            .create(&ResourceSpec::SecurityGroup {
                name: "alb-sg".into(),
                vpc_id: "vpc-0001".into(),
                description: String::new(),
                ingress: vec![IngressRule::tcp_from_cidr(80, "0.0.0.0/0", "http")],
            })
            .await
            .unwrap();
        provider
            .create(&ResourceSpec::SecurityGroup {
                name: "ec2-sg".into(),
                vpc_id: "vpc-0001".into(),
                description: String::new(),
                ingress: vec![IngressRule::tcp_from_group(
                    8501,
                    alb_sg.id.clone().unwrap(),
                    "from alb",
                )],
            })
            .await
            .unwrap();

        let removed = provider.detach_references(&[alb_sg]).await.unwrap();
        assert_eq!(removed, 1);
    }
}
