//! Teardown orchestrator
//!
//! Removes everything a provisioning run may have created, in reverse
//! dependency order. Targets are discovered by project-name pattern, so a
//! teardown needs nothing from the run that created them. A failure to
//! remove one resource is recorded and the run moves on.

use crate::naming::RunConfig;
use agentstack_cloud::{
    CloudProvider, PollPolicy, Removal, ResourceDescriptor, ResourceKind, RetryConfig,
    TeardownReport, TerminalStates, attr, await_absent, await_active, delete_with_retry,
    with_retry,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Report entry name for a kind whose listing failed
pub const DISCOVERY: &str = "<discovery>";

#[derive(Debug, Clone)]
pub struct TeardownTimings {
    /// Listing resources by project pattern
    pub discovery_retry: RetryConfig,
    /// Deletes failing with a dependency violation
    pub retry: RetryConfig,
    /// VPC deletion while dependents drain
    pub vpc_retry: RetryConfig,
    pub instance_termination: PollPolicy,
    pub nat_deletion: PollPolicy,
    pub endpoint_deletion: PollPolicy,
    /// After load balancers go, before target groups
    pub load_balancer_settle: Duration,
    /// Before the final VPC pass
    pub final_pass_pause: Duration,
}

impl Default for TeardownTimings {
    fn default() -> Self {
        Self {
            discovery_retry: RetryConfig::throttling(),
            retry: RetryConfig::dependency_drain(),
            vpc_retry: RetryConfig::dependency_drain().with_max_attempts(10),
            instance_termination: PollPolicy::new(
                Duration::from_secs(15),
                Duration::from_secs(600),
            ),
            nat_deletion: PollPolicy::new(Duration::from_secs(15), Duration::from_secs(600)),
            endpoint_deletion: PollPolicy::new(Duration::from_secs(30), Duration::from_secs(300)),
            load_balancer_settle: Duration::from_secs(30),
            final_pass_pause: Duration::from_secs(60),
        }
    }
}

impl TeardownTimings {
    pub fn immediate() -> Self {
        Self {
            discovery_retry: RetryConfig::immediate(3),
            retry: RetryConfig::immediate(3),
            vpc_retry: RetryConfig::immediate(3),
            instance_termination: PollPolicy::immediate(5),
            nat_deletion: PollPolicy::immediate(5),
            endpoint_deletion: PollPolicy::immediate(5),
            load_balancer_settle: Duration::ZERO,
            final_pass_pause: Duration::ZERO,
        }
    }
}

pub struct Teardown<'a> {
    provider: &'a dyn CloudProvider,
    run: RunConfig,
    timings: TeardownTimings,
}

impl<'a> Teardown<'a> {
    pub fn new(provider: &'a dyn CloudProvider, run: RunConfig) -> Self {
        Self {
            provider,
            run,
            timings: TeardownTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: TeardownTimings) -> Self {
        self.timings = timings;
        self
    }

    pub async fn run(&self) -> TeardownReport {
        let started = Instant::now();
        let mut report = TeardownReport::new();
        info!(
            project = %self.run.project_name,
            region = %self.run.region,
            "Starting infrastructure teardown"
        );

        self.disable_distributions(&mut report).await;
        self.load_balancing(&mut report).await;
        self.instances(&mut report).await;
        self.nat_gateways(&mut report).await;
        self.endpoints(&mut report).await;
        self.security_groups(&mut report).await;
        self.route_tables(&mut report).await;
        self.vpcs(&mut report).await;
        self.search(&mut report).await;
        self.knowledge_bases(&mut report).await;
        self.simple(&mut report, ResourceKind::Secret, "secrets").await;
        self.identities(&mut report).await;
        self.buckets(&mut report).await;
        self.delete_distributions(&mut report).await;

        if !report.failed_of(ResourceKind::Vpc).is_empty() {
            self.final_vpc_pass(&mut report).await;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        if report.is_success() {
            info!("✓ Teardown completed: {}", report);
        } else {
            warn!("Teardown completed with failures: {}", report);
            for entry in &report.failed {
                warn!(
                    "  {} {}: {}",
                    entry.kind,
                    entry.name,
                    entry.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        report
    }

    // ---- helpers ----

    /// Every resource of `kind` carrying the project name
    ///
    /// A listing that still fails after throttling retries is a failure of the
    /// run: whatever it would have found is left in place.
    async fn discover(
        &self,
        report: &mut TeardownReport,
        kind: ResourceKind,
    ) -> Vec<ResourceDescriptor> {
        let what = format!("list {}", kind);
        let listed = with_retry(&what, &self.timings.discovery_retry, || {
            self.provider.discover(kind, &self.run.project_name)
        })
        .await;
        match listed {
            Ok(found) => {
                debug!(%kind, count = found.len(), "Discovered");
                found
            }
            Err(err) => {
                warn!("  Could not list {} resources: {}", kind, err);
                let recorded = report.failed_of(kind).iter().any(|e| e.name == DISCOVERY);
                if !recorded {
                    report.add_failure(kind, DISCOVERY, err.to_string());
                }
                Vec::new()
            }
        }
    }

    /// Provider-side cleanup before delete; a missing target is not an error
    async fn release(&self, target: &ResourceDescriptor) {
        match self.provider.release(target).await {
            Ok(()) => debug!(target = %target.label(), "Released"),
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!("  Could not release {}: {}", target.label(), err),
        }
    }

    async fn remove_with(
        &self,
        report: &mut TeardownReport,
        target: &ResourceDescriptor,
        retry: &RetryConfig,
    ) -> bool {
        match delete_with_retry(self.provider, target, retry).await {
            Ok(removal) => {
                match removal {
                    Removal::Deleted => info!("  ✓ Deleted {}", target.label()),
                    Removal::AlreadyAbsent => debug!(target = %target.label(), "Already deleted"),
                }
                report.add_success(target.kind, target.name.clone(), removal);
                true
            }
            Err(err) => {
                warn!("  Failed to delete {}: {}", target.label(), err);
                report.add_failure(target.kind, target.name.clone(), err.to_string());
                false
            }
        }
    }

    async fn remove(&self, report: &mut TeardownReport, target: &ResourceDescriptor) -> bool {
        self.remove_with(report, target, &self.timings.retry).await
    }

    /// Discover and delete every resource of one kind
    async fn simple(&self, report: &mut TeardownReport, kind: ResourceKind, what: &str) {
        info!("Deleting {}...", what);
        for target in self.discover(report, kind).await {
            self.remove(report, &target).await;
        }
    }

    async fn await_gone(&self, target: &ResourceDescriptor, policy: &PollPolicy) {
        let Some(id) = target.id.as_deref() else {
            return;
        };
        let provider = self.provider;
        let kind = target.kind;
        let waited = await_active(&target.label(), policy, &TerminalStates::gone(), || async move {
            match provider.status(kind, id).await {
                Err(err) if err.is_not_found() => Ok("deleted".to_string()),
                other => other,
            }
        })
        .await;
        if let Err(err) = waited {
            warn!("  {} did not finish deleting: {}", target.label(), err);
        }
    }

    // ---- steps ----

    /// A distribution must be disabled, and that must finish deploying, before it can go
    async fn disable_distributions(&self, report: &mut TeardownReport) {
        info!("Disabling CloudFront distributions...");
        for distribution in self.discover(report, ResourceKind::Distribution).await {
            if distribution.attribute::<bool>(attr::ENABLED) == Some(false) {
                debug!(target = %distribution.label(), "Already disabled");
                continue;
            }
            self.release(&distribution).await;
            info!("  Disabled {}", distribution.label());
        }
    }

    async fn load_balancing(&self, report: &mut TeardownReport) {
        info!("Deleting load balancers...");
        for listener in self.discover(report, ResourceKind::Listener).await {
            self.remove(report, &listener).await;
        }

        let balancers = self.discover(report, ResourceKind::LoadBalancer).await;
        let mut removed_any = false;
        for balancer in &balancers {
            removed_any |= self.remove(report, balancer).await;
        }
        if removed_any && !self.timings.load_balancer_settle.is_zero() {
            debug!("Waiting for load balancers to release their target groups");
            tokio::time::sleep(self.timings.load_balancer_settle).await;
        }

        for group in self.discover(report, ResourceKind::TargetGroup).await {
            self.remove(report, &group).await;
        }
    }

    async fn instances(&self, report: &mut TeardownReport) {
        info!("Terminating EC2 instances...");
        for instance in self.discover(report, ResourceKind::Instance).await {
            if instance.attr_str(attr::STATE) == Some("terminated") {
                continue;
            }
            if self.remove(report, &instance).await {
                self.await_gone(&instance, &self.timings.instance_termination).await;
            }
        }
    }

    async fn nat_gateways(&self, report: &mut TeardownReport) {
        info!("Deleting NAT gateways...");
        for gateway in self.discover(report, ResourceKind::NatGateway).await {
            if gateway.attr_str(attr::STATE) == Some("deleted") {
                continue;
            }
            // Routes through the gateway block its deletion
            self.release(&gateway).await;
            if self.remove(report, &gateway).await {
                self.await_gone(&gateway, &self.timings.nat_deletion).await;
            }
        }
    }

    async fn endpoints(&self, report: &mut TeardownReport) {
        info!("Deleting VPC endpoints...");
        for endpoint in self.discover(report, ResourceKind::VpcEndpoint).await {
            if !self.remove(report, &endpoint).await {
                continue;
            }
            let name = endpoint.name.clone();
            let absent = await_absent(&endpoint.label(), &self.timings.endpoint_deletion, || {
                self.provider.find(ResourceKind::VpcEndpoint, &name)
            })
            .await;
            if let Err(err) = absent {
                warn!("  {} still present: {}", endpoint.label(), err);
            }
        }
    }

    async fn security_groups(&self, report: &mut TeardownReport) {
        info!("Deleting security groups...");
        let groups: Vec<ResourceDescriptor> = self
            .discover(report, ResourceKind::SecurityGroup)
            .await
            .into_iter()
            .filter(|g| g.name != "default")
            .collect();
        if groups.is_empty() {
            return;
        }

        for group in &groups {
            self.release(group).await;
        }
        match self.provider.detach_references(&groups).await {
            Ok(0) => {}
            Ok(removed) => info!("  Removed {} cross-group rules", removed),
            Err(err) => warn!("  Could not strip security group references: {}", err),
        }
        for group in &groups {
            self.remove(report, group).await;
        }
    }

    async fn route_tables(&self, report: &mut TeardownReport) {
        info!("Deleting route tables...");
        for table in self.discover(report, ResourceKind::RouteTable).await {
            if table.attribute::<bool>(attr::IS_DEFAULT) == Some(true) {
                continue;
            }
            self.release(&table).await;
            self.remove(report, &table).await;
        }
    }

    async fn vpcs(&self, report: &mut TeardownReport) {
        info!("Deleting VPCs...");
        for vpc in self.discover(report, ResourceKind::Vpc).await {
            if vpc.attribute::<bool>(attr::IS_DEFAULT) == Some(true) {
                warn!("  Skipping default VPC {}", vpc.label());
                continue;
            }
            self.release(&vpc).await;
            self.remove_with(report, &vpc, &self.timings.vpc_retry).await;
        }
    }

    async fn search(&self, report: &mut TeardownReport) {
        info!("Deleting OpenSearch collection and policies...");
        for collection in self.discover(report, ResourceKind::Collection).await {
            self.remove(report, &collection).await;
        }
        for policy in self.discover(report, ResourceKind::SecurityPolicy).await {
            self.remove(report, &policy).await;
        }
        for policy in self.discover(report, ResourceKind::AccessPolicy).await {
            self.remove(report, &policy).await;
        }
    }

    async fn knowledge_bases(&self, report: &mut TeardownReport) {
        info!("Deleting knowledge bases...");
        for knowledge_base in self.discover(report, ResourceKind::KnowledgeBase).await {
            // Data sources go first
            self.release(&knowledge_base).await;
            self.remove(report, &knowledge_base).await;
        }
    }

    async fn identities(&self, report: &mut TeardownReport) {
        info!("Deleting IAM roles...");
        for role in self.discover(report, ResourceKind::Role).await {
            self.release(&role).await;
            self.remove(report, &role).await;
        }
        for profile in self.discover(report, ResourceKind::InstanceProfile).await {
            self.release(&profile).await;
            self.remove(report, &profile).await;
        }
    }

    async fn buckets(&self, report: &mut TeardownReport) {
        info!("Deleting S3 buckets...");
        for name in [self.run.bucket_name(), self.run.legacy_bucket_name()] {
            let bucket = match self.provider.find(ResourceKind::Bucket, &name).await {
                Ok(Some(bucket)) => bucket,
                Ok(None) => {
                    debug!(bucket = %name, "Not present");
                    continue;
                }
                Err(err) => {
                    warn!("  Could not look up bucket {}: {}", name, err);
                    report.add_failure(ResourceKind::Bucket, name, err.to_string());
                    continue;
                }
            };
            self.release(&bucket).await;
            self.remove(report, &bucket).await;
        }
    }

    /// Distributions still finishing their disable are left for a later run
    async fn delete_distributions(&self, report: &mut TeardownReport) {
        info!("Deleting disabled CloudFront distributions...");
        let once = RetryConfig::immediate(1);
        for distribution in self.discover(report, ResourceKind::Distribution).await {
            match delete_with_retry(self.provider, &distribution, &once).await {
                Ok(removal) => {
                    info!("  ✓ Deleted {}", distribution.label());
                    report.add_success(
                        ResourceKind::Distribution,
                        distribution.name.clone(),
                        removal,
                    );
                }
                Err(err) if err.is_dependency_violation() => {
                    warn!(
                        "  {} is still being disabled; run uninstall again once it is deployed",
                        distribution.label()
                    );
                }
                Err(err) => {
                    warn!("  Failed to delete {}: {}", distribution.label(), err);
                    report.add_failure(
                        ResourceKind::Distribution,
                        distribution.name.clone(),
                        err.to_string(),
                    );
                }
            }
        }
    }

    async fn final_vpc_pass(&self, report: &mut TeardownReport) {
        info!("Retrying VPC deletion...");
        if !self.timings.final_pass_pause.is_zero() {
            tokio::time::sleep(self.timings.final_pass_pause).await;
        }

        // A listing that failed in the first pass gets another chance
        report.clear_failure(ResourceKind::Vpc, DISCOVERY);
        for vpc in self.discover(report, ResourceKind::Vpc).await {
            if vpc.attribute::<bool>(attr::IS_DEFAULT) == Some(true) {
                continue;
            }
            self.release(&vpc).await;
            match delete_with_retry(self.provider, &vpc, &self.timings.vpc_retry).await {
                Ok(removal) => {
                    info!("  ✓ Deleted {} on retry", vpc.label());
                    report.clear_failure(ResourceKind::Vpc, &vpc.name);
                    report.add_success(ResourceKind::Vpc, vpc.name.clone(), removal);
                }
                Err(err) => warn!("  {} still cannot be deleted: {}", vpc.label(), err),
            }
        }
    }
}
