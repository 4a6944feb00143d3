//! Remote setup re-runs and placement audits for the compute instance

use crate::error::{DeployError, Result};
use crate::naming::RunConfig;
use crate::provision::id_of;
use crate::user_data::render_setup_script;
use agentstack_cloud::{
    CloudProvider, ConfigStore, DeploymentConfig, Invocation, NetworkSnapshot, PollPolicy,
    RemoteShell, ResourceDescriptor, ResourceKind, TerminalStates, attr, await_active,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const OUTPUT_PREVIEW: usize = 500;
const SUBNET_TYPE_TAG: &str = "aws-cdk:subnet-type";

#[derive(Debug, Clone)]
pub struct RemoteTimings {
    /// Waiting for the instance to register with the command channel
    pub agent_wait: PollPolicy,
    /// Waiting for the setup command to finish
    pub command: PollPolicy,
}

impl Default for RemoteTimings {
    fn default() -> Self {
        Self {
            agent_wait: PollPolicy::attempts(Duration::from_secs(10), 30),
            command: PollPolicy::new(Duration::from_secs(10), Duration::from_secs(3600)),
        }
    }
}

impl RemoteTimings {
    pub fn immediate() -> Self {
        Self {
            agent_wait: PollPolicy::immediate(3),
            command: PollPolicy::immediate(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub instance_id: String,
    pub command_id: String,
    pub status: String,
    /// Start of the command's standard output
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetPlacement {
    Public,
    Private,
}

/// Where one instance landed in the network
#[derive(Debug, Clone, Serialize)]
pub struct PlacementAudit {
    pub instance_id: String,
    pub state: Option<String>,
    pub subnet_id: Option<String>,
    pub subnet_cidr: Option<String>,
    pub placement: SubnetPlacement,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

impl PlacementAudit {
    /// Reachable from the internet without the load balancer
    pub fn is_exposed(&self) -> bool {
        self.placement == SubnetPlacement::Public || self.public_ip.is_some()
    }
}

pub struct RemoteSetup<'a> {
    provider: &'a dyn CloudProvider,
    shell: &'a dyn RemoteShell,
    run: RunConfig,
    store: ConfigStore,
    timings: RemoteTimings,
}

impl<'a> RemoteSetup<'a> {
    pub fn new(
        provider: &'a dyn CloudProvider,
        shell: &'a dyn RemoteShell,
        run: RunConfig,
        store: ConfigStore,
    ) -> Self {
        Self {
            provider,
            shell,
            run,
            store,
            timings: RemoteTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: RemoteTimings) -> Self {
        self.timings = timings;
        self
    }

    /// The running instance named after the project
    async fn running_instance(&self) -> Result<String> {
        let name = self.run.instance_name();
        let instance = self
            .provider
            .find(ResourceKind::Instance, &name)
            .await?
            .ok_or_else(|| DeployError::InstanceNotFound(name.clone()))?;
        let id = id_of(&instance)?;
        let state = self.provider.status(ResourceKind::Instance, &id).await?;
        if state != "running" {
            debug!(instance = %id, %state, "Instance is not running");
            return Err(DeployError::InstanceNotFound(name));
        }
        Ok(id)
    }

    /// Stored deployment values over the defaults derived from the run
    async fn environment(&self) -> Result<DeploymentConfig> {
        let mut config = DeploymentConfig {
            project_name: Some(self.run.project_name.clone()),
            account_id: Some(self.run.account_id.clone()),
            region: Some(self.run.region.clone()),
            s3_bucket: Some(self.run.bucket_name()),
            s3_arn: Some(self.run.bucket_arn()),
            ..Default::default()
        };
        match self.store.load().await {
            Ok(stored) => config.merge(&stored),
            Err(err) => warn!(
                "Could not read {}, using defaults: {}",
                self.store.path().display(),
                err
            ),
        }
        Ok(config)
    }

    async fn await_agent(&self, instance_id: &str) -> Result<()> {
        info!("Waiting for SSM agent on {}...", instance_id);
        let shell = self.shell;
        await_active(
            &format!("SSM agent on {}", instance_id),
            &self.timings.agent_wait,
            &TerminalStates::new(&["Online"], &[]),
            || async move {
                let managed = shell.is_managed(instance_id).await?;
                Ok(if managed { "Online" } else { "Offline" }.to_string())
            },
        )
        .await?;
        info!("✓ SSM agent is ready");
        Ok(())
    }

    async fn await_command(&self, command_id: &str, instance_id: &str) -> Result<Invocation> {
        let policy = &self.timings.command;
        let mut last = Invocation::default();
        for attempt in 1..=policy.max_attempts {
            match self.shell.invocation(command_id, instance_id).await {
                Ok(invocation) if invocation.is_finished() => return Ok(invocation),
                Ok(invocation) => {
                    debug!(
                        command = command_id,
                        status = %invocation.status,
                        attempt,
                        "Command running"
                    );
                    last = invocation;
                }
                // The invocation is not visible right after sending
                Err(err) if err.is_not_found() => {
                    debug!(command = command_id, "Invocation pending")
                }
                Err(err) => return Err(err.into()),
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        Err(agentstack_cloud::CloudError::Timeout(format!(
            "command {} still {} after {:?}",
            command_id,
            if last.status.is_empty() { "pending" } else { last.status.as_str() },
            policy.timeout
        ))
        .into())
    }

    /// Send the setup script to an instance and wait for it to finish
    pub async fn run_setup(&self, instance_id: Option<&str>) -> Result<SetupOutcome> {
        let instance_id = match instance_id {
            Some(id) => id.to_string(),
            None => self.running_instance().await?,
        };
        info!("Running setup script on instance: {}", instance_id);

        let config = self.environment().await?;
        let script = render_setup_script(&self.run, &config.environment())?;

        self.await_agent(&instance_id).await?;

        let comment = format!("Setup script for {}", self.run.project_name);
        let command_id = self.shell.send_script(&instance_id, &script, &comment).await?;
        info!("Command ID: {}", command_id);

        let invocation = self.await_command(&command_id, &instance_id).await?;
        if !invocation.is_success() {
            return Err(DeployError::RemoteSetup {
                status: invocation.status,
                stderr: invocation.stderr,
            });
        }

        Ok(SetupOutcome {
            instance_id,
            command_id,
            status: invocation.status,
            output: invocation.stdout.chars().take(OUTPUT_PREVIEW).collect(),
        })
    }

    /// Report the subnet placement of every project instance
    pub async fn verify_deployment(&self) -> Result<Vec<PlacementAudit>> {
        let instances = self
            .provider
            .discover(ResourceKind::Instance, &self.run.instance_name())
            .await?;
        if instances.is_empty() {
            warn!("No EC2 instance found with name: {}", self.run.instance_name());
            return Ok(Vec::new());
        }

        let mut audits = Vec::with_capacity(instances.len());
        for instance in &instances {
            let snapshot = self.snapshot_for(instance).await?;
            let audit = audit_instance(instance, snapshot.as_ref())?;

            info!("Instance: {}", audit.instance_id);
            info!("  Subnet: {}", audit.subnet_id.as_deref().unwrap_or("unknown"));
            info!("  Subnet CIDR: {}", audit.subnet_cidr.as_deref().unwrap_or("unknown"));
            info!("  Subnet type: {:?}", audit.placement);
            info!("  Private IP: {}", audit.private_ip.as_deref().unwrap_or("none"));
            if audit.placement == SubnetPlacement::Public {
                warn!("  Instance {} is in a public subnet", audit.instance_id);
            }
            if let Some(ip) = &audit.public_ip {
                warn!("  Instance {} has a public IP: {}", audit.instance_id, ip);
            }
            if !audit.is_exposed() {
                info!("  ✓ Instance is correctly placed in a private subnet");
            }
            audits.push(audit);
        }
        Ok(audits)
    }

    async fn snapshot_for(&self, instance: &ResourceDescriptor) -> Result<Option<NetworkSnapshot>> {
        let vpc_id = match instance.attr_str(attr::VPC_ID) {
            Some(id) => Some(id.to_string()),
            None => self
                .provider
                .find(ResourceKind::Vpc, &self.run.vpc_name())
                .await?
                .and_then(|vpc| vpc.id),
        };
        match vpc_id {
            Some(id) => Ok(Some(self.provider.network_snapshot(&id).await?)),
            None => Ok(None),
        }
    }
}

/// Private when tagged so, or when the subnet has no default route to an
/// internet gateway
fn audit_instance(
    instance: &ResourceDescriptor,
    snapshot: Option<&NetworkSnapshot>,
) -> Result<PlacementAudit> {
    let subnet_id = instance.attr_str(attr::SUBNET_ID).map(str::to_string);
    let subnet = subnet_id
        .as_deref()
        .and_then(|id| snapshot.and_then(|s| s.subnet(id)));

    let tagged_private = subnet
        .and_then(|s| s.tags.get(SUBNET_TYPE_TAG))
        .is_some_and(|t| t == "Private");
    let routes_out = match (subnet_id.as_deref(), snapshot) {
        (Some(id), Some(snapshot)) => snapshot
            .route_table_for(id)
            .is_some_and(|rt| rt.has_default_internet_route()),
        _ => false,
    };
    let placement = if tagged_private || !routes_out {
        SubnetPlacement::Private
    } else {
        SubnetPlacement::Public
    };

    Ok(PlacementAudit {
        instance_id: id_of(instance)?,
        state: instance.attr_str(attr::STATE).map(str::to_string),
        subnet_cidr: subnet.map(|s| s.cidr.clone()),
        subnet_id,
        placement,
        public_ip: instance.attr_str(attr::PUBLIC_IP).map(str::to_string),
        private_ip: instance.attr_str(attr::PRIVATE_IP).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentstack_cloud::{RouteInfo, RouteTableInfo, SubnetInfo};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot() -> NetworkSnapshot {
        NetworkSnapshot {
            subnets: vec![
                SubnetInfo {
                    id: "subnet-pub".into(),
                    cidr: "10.20.0.0/24".into(),
                    ..Default::default()
                },
                SubnetInfo {
                    id: "subnet-priv".into(),
                    cidr: "10.20.2.0/24".into(),
                    tags: BTreeMap::from([(SUBNET_TYPE_TAG.to_string(), "Private".to_string())]),
                    ..Default::default()
                },
            ],
            route_tables: vec![RouteTableInfo {
                id: "rtb-main".into(),
                main: true,
                subnet_ids: vec![],
                routes: vec![RouteInfo {
                    destination: "0.0.0.0/0".into(),
                    gateway_id: Some("igw-1".into()),
                    nat_gateway_id: None,
                }],
            }],
        }
    }

    fn instance(subnet: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::Instance, "app-for-demo")
            .with_id("i-0001")
            .with_attribute(attr::SUBNET_ID, json!(subnet))
            .with_attribute(attr::PRIVATE_IP, json!("10.20.2.15"))
    }

    #[test]
    fn test_private_tag_wins_over_routes() {
        let audit = audit_instance(&instance("subnet-priv"), Some(&snapshot())).unwrap();
        assert_eq!(audit.placement, SubnetPlacement::Private);
        assert_eq!(audit.subnet_cidr.as_deref(), Some("10.20.2.0/24"));
        assert!(!audit.is_exposed());
    }

    #[test]
    fn test_internet_route_means_public() {
        let audit = audit_instance(&instance("subnet-pub"), Some(&snapshot())).unwrap();
        assert_eq!(audit.placement, SubnetPlacement::Public);
        assert!(audit.is_exposed());
    }

    #[test]
    fn test_public_ip_is_exposed() {
        let with_ip = instance("subnet-priv").with_attribute(attr::PUBLIC_IP, json!("54.1.2.3"));
        let audit = audit_instance(&with_ip, Some(&snapshot())).unwrap();
        assert_eq!(audit.placement, SubnetPlacement::Private);
        assert!(audit.is_exposed());
    }
}
