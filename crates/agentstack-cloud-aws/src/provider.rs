//! AWS provider implementation

use crate::cli::{AwsCli, text};
use crate::error::{AwsError, Result};
use crate::search::IndexClient;
use crate::{balancer, cdn, compute, iam, knowledge, network, search, secrets, storage};
use agentstack_cloud::{
    AuthStatus, CloudProvider, Invocation, NetworkSnapshot, RemoteShell, ResourceDescriptor,
    ResourceKind, ResourceSpec, Setting, attr,
};
use async_trait::async_trait;

/// Name prefix of project VPCs; the rest is the project name
const VPC_PREFIX: &str = "vpc-for-";

/// AWS provider
///
/// Control-plane calls go through the `aws` CLI, so credentials, profiles
/// and SSO sessions are whatever the CLI is configured with.
pub struct AwsProvider {
    cli: AwsCli,
    index: IndexClient,
}

impl AwsProvider {
    pub fn new(region: impl Into<String>) -> Result<Self> {
        Ok(Self {
            cli: AwsCli::new(region),
            index: IndexClient::new()?,
        })
    }

    pub fn with_cli(cli: AwsCli) -> Result<Self> {
        Ok(Self {
            cli,
            index: IndexClient::new()?,
        })
    }

    pub fn region(&self) -> &str {
        self.cli.region()
    }

    async fn caller_identity(&self) -> Result<AuthStatus> {
        self.cli.check_installed().await?;
        let identity = self.cli.run("sts", &["get-caller-identity"]).await?;
        let account = text(&identity, "/Account").ok_or_else(|| {
            AwsError::UnexpectedResponse(format!("get-caller-identity: {}", identity))
        })?;
        let caller = text(&identity, "/Arn").unwrap_or_default();
        Ok(AuthStatus::ok(account, caller))
    }

    async fn find_vector_index(&self, name: &str) -> Result<Option<ResourceDescriptor>> {
        let Some(collection) = search::find_collection(&self.cli, name).await? else {
            return Ok(None);
        };
        let Some(endpoint) = collection.attr_str(attr::ENDPOINT) else {
            return Ok(None);
        };
        if self.index.exists(&self.cli, endpoint, name).await? {
            Ok(Some(search::index_descriptor(name, endpoint)))
        } else {
            Ok(None)
        }
    }

    async fn find_any(&self, kind: ResourceKind, name: &str) -> Result<Option<ResourceDescriptor>> {
        let cli = &self.cli;
        match kind {
            ResourceKind::Bucket => storage::find(cli, name).await,
            ResourceKind::Role => iam::find_role(cli, name).await,
            ResourceKind::InstanceProfile => iam::find_profile(cli, name).await,
            ResourceKind::Secret => secrets::find(cli, name).await,
            ResourceKind::SecurityPolicy => search::find_security_policy(cli, name).await,
            ResourceKind::AccessPolicy => search::find_access_policy(cli, name).await,
            ResourceKind::Collection => search::find_collection(cli, name).await,
            ResourceKind::VectorIndex => self.find_vector_index(name).await,
            ResourceKind::KnowledgeBase => knowledge::find(cli, name).await,
            ResourceKind::DataSource => knowledge::find_data_source(cli, name).await,
            ResourceKind::Vpc
            | ResourceKind::Subnet
            | ResourceKind::InternetGateway
            | ResourceKind::NatGateway
            | ResourceKind::RouteTable
            | ResourceKind::SecurityGroup
            | ResourceKind::VpcEndpoint => network::find(cli, kind, name).await,
            ResourceKind::LoadBalancer => balancer::find_load_balancer(cli, name).await,
            ResourceKind::TargetGroup => balancer::find_target_group(cli, name).await,
            ResourceKind::Listener => balancer::find_listener(cli, name).await,
            ResourceKind::ListenerRule => balancer::find_rule(cli, name).await,
            ResourceKind::OriginAccessIdentity => cdn::find_oai(cli, name).await,
            ResourceKind::Distribution => cdn::find_distribution(cli, name).await,
            ResourceKind::Instance => compute::find(cli, name).await,
        }
    }

    async fn create_any(&self, spec: &ResourceSpec) -> Result<ResourceDescriptor> {
        let cli = &self.cli;
        match spec {
            ResourceSpec::Bucket { name } => storage::create(cli, name).await,
            ResourceSpec::Role {
                name,
                trust_policy,
                description,
            } => iam::create_role(cli, name, trust_policy, description).await,
            ResourceSpec::InstanceProfile { name } => iam::create_profile(cli, name).await,
            ResourceSpec::Secret {
                name,
                description,
                payload,
            } => secrets::create(cli, name, description, payload).await,
            ResourceSpec::SecurityPolicy {
                name,
                policy_type,
                document,
                description,
            } => {
                search::create_security_policy(cli, name, *policy_type, document, description)
                    .await
            }
            ResourceSpec::AccessPolicy {
                name,
                document,
                description,
            } => search::create_access_policy(cli, name, document, description).await,
            ResourceSpec::Collection { name, description } => {
                search::create_collection(cli, name, description).await
            }
            ResourceSpec::VectorIndex {
                name,
                endpoint,
                body,
            } => {
                self.index.create(cli, endpoint, name, body).await?;
                Ok(search::index_descriptor(name, endpoint))
            }
            ResourceSpec::KnowledgeBase {
                name,
                description,
                role_arn,
                collection_arn,
                index_name,
                embedding_model_arn,
                dimensions,
            } => {
                knowledge::create(
                    cli,
                    name,
                    description,
                    role_arn,
                    collection_arn,
                    index_name,
                    embedding_model_arn,
                    *dimensions,
                )
                .await
            }
            ResourceSpec::DataSource {
                name,
                knowledge_base_id,
                bucket_arn,
                inclusion_prefixes,
                parsing_model_arn,
            } => {
                knowledge::create_data_source(
                    cli,
                    name,
                    knowledge_base_id,
                    bucket_arn,
                    inclusion_prefixes,
                    parsing_model_arn,
                )
                .await
            }
            ResourceSpec::Vpc { name, cidr } => network::create_vpc(cli, name, cidr).await,
            ResourceSpec::Subnet {
                name,
                vpc_id,
                cidr,
                availability_zone,
                ..
            } => network::create_subnet(cli, name, vpc_id, cidr, availability_zone).await,
            ResourceSpec::InternetGateway { name, vpc_id } => {
                network::create_internet_gateway(cli, name, vpc_id).await
            }
            ResourceSpec::NatGateway { name, subnet_id } => {
                network::create_nat_gateway(cli, name, subnet_id).await
            }
            ResourceSpec::RouteTable { name, vpc_id } => {
                network::create_route_table(cli, name, vpc_id).await
            }
            ResourceSpec::SecurityGroup {
                name,
                vpc_id,
                description,
                ingress,
            } => network::create_security_group(cli, name, vpc_id, description, ingress).await,
            ResourceSpec::VpcEndpoint {
                name,
                vpc_id,
                service_name,
                subnet_ids,
                security_group_ids,
            } => {
                network::create_vpc_endpoint(
                    cli,
                    name,
                    vpc_id,
                    service_name,
                    subnet_ids,
                    security_group_ids,
                )
                .await
            }
            ResourceSpec::LoadBalancer {
                name,
                subnet_ids,
                security_group_ids,
            } => balancer::create_load_balancer(cli, name, subnet_ids, security_group_ids).await,
            ResourceSpec::TargetGroup {
                name,
                vpc_id,
                port,
                health_check_path,
            } => balancer::create_target_group(cli, name, vpc_id, *port, health_check_path).await,
            ResourceSpec::Listener {
                name,
                load_balancer_arn,
                target_group_arn,
                port,
            } => {
                balancer::create_listener(cli, name, load_balancer_arn, target_group_arn, *port)
                    .await
            }
            ResourceSpec::ListenerRule {
                name,
                listener_arn,
                target_group_arn,
                priority,
                header_name,
                header_value,
            } => {
                balancer::create_rule(
                    cli,
                    name,
                    listener_arn,
                    target_group_arn,
                    *priority,
                    header_name,
                    header_value,
                )
                .await
            }
            ResourceSpec::OriginAccessIdentity { name } => {
                let project = name
                    .strip_prefix("OAI for ")
                    .and_then(|rest| rest.strip_suffix(" S3 bucket"))
                    .unwrap_or(name);
                cdn::create_oai(cli, project, name).await
            }
            ResourceSpec::Distribution {
                name,
                project_name,
                alb_dns,
                bucket_domain,
                oai_id,
                static_paths,
            } => {
                let origins = cdn::DistributionOrigins {
                    project_name,
                    comment: name,
                    alb_dns,
                    bucket_domain,
                    oai_id,
                    static_paths,
                };
                cdn::create_distribution(cli, &origins).await
            }
            ResourceSpec::Instance {
                name,
                image_id,
                instance_type,
                subnet_id,
                security_group_ids,
                instance_profile,
                volume_size_gb,
                user_data,
            } => {
                let launch = compute::Launch {
                    name,
                    image_id,
                    instance_type,
                    subnet_id,
                    security_group_ids,
                    instance_profile,
                    volume_size_gb: *volume_size_gb,
                    user_data,
                };
                compute::create(cli, &launch).await
            }
        }
    }

    async fn apply_any(&self, setting: &Setting) -> Result<()> {
        let cli = &self.cli;
        match setting {
            Setting::BucketDefaults { bucket } => storage::apply_defaults(cli, bucket).await,
            Setting::BucketPolicy { bucket, policy } => {
                storage::put_policy(cli, bucket, policy).await
            }
            Setting::RoleInlinePolicy { role, policy } => {
                iam::put_inline_policy(cli, role, policy).await
            }
            Setting::RoleManagedPolicy { role, policy_arn } => {
                iam::attach_managed_policy(cli, role, policy_arn).await
            }
            Setting::InstanceProfileRole { profile, role } => {
                iam::add_role_to_profile(cli, profile, role).await
            }
            Setting::AccessPolicyPrincipals { policy, principals } => {
                search::add_principals(cli, policy, principals).await
            }
            Setting::VpcDnsSupport { vpc_id } => network::enable_dns(cli, vpc_id).await,
            Setting::SubnetPublicIp { subnet_id } => network::map_public_ip(cli, subnet_id).await,
            Setting::Route {
                route_table_id,
                destination,
                target,
            } => network::create_route(cli, route_table_id, destination, target).await,
            Setting::RouteTableAssociation {
                route_table_id,
                subnet_id,
            } => network::associate_route_table(cli, route_table_id, subnet_id).await,
            Setting::TargetRegistration {
                target_group_arn,
                instance_id,
                port,
            } => balancer::register_target(cli, target_group_arn, instance_id, *port).await,
            Setting::EnableDistribution { distribution_id } => {
                cdn::set_enabled(cli, distribution_id, true).await
            }
        }
    }

    async fn status_of(&self, kind: ResourceKind, id: &str) -> Result<String> {
        let cli = &self.cli;
        match kind {
            ResourceKind::Collection => search::collection_status(cli, id).await,
            ResourceKind::KnowledgeBase => knowledge::status(cli, id).await,
            ResourceKind::Vpc
            | ResourceKind::Subnet
            | ResourceKind::NatGateway
            | ResourceKind::VpcEndpoint => network::status(cli, kind, id).await,
            ResourceKind::LoadBalancer => balancer::load_balancer_status(cli, id).await,
            ResourceKind::Distribution => cdn::distribution_status(cli, id).await,
            ResourceKind::Instance => compute::status(cli, id).await,
            other => Err(AwsError::Unsupported(format!("status of {}", other))),
        }
    }

    async fn discover_any(
        &self,
        kind: ResourceKind,
        pattern: &str,
    ) -> Result<Vec<ResourceDescriptor>> {
        let cli = &self.cli;
        match kind {
            ResourceKind::Bucket => storage::discover(cli, pattern).await,
            ResourceKind::Role => iam::discover_roles(cli, pattern).await,
            ResourceKind::InstanceProfile => iam::discover_profiles(cli, pattern).await,
            ResourceKind::Secret => secrets::discover(cli, pattern).await,
            ResourceKind::SecurityPolicy => search::discover_security_policies(cli, pattern).await,
            ResourceKind::AccessPolicy => search::discover_access_policies(cli, pattern).await,
            ResourceKind::Collection => search::discover_collections(cli, pattern).await,
            ResourceKind::KnowledgeBase => knowledge::discover(cli, pattern).await,
            ResourceKind::Vpc
            | ResourceKind::Subnet
            | ResourceKind::InternetGateway
            | ResourceKind::NatGateway
            | ResourceKind::RouteTable
            | ResourceKind::SecurityGroup
            | ResourceKind::VpcEndpoint => network::discover(cli, kind, pattern).await,
            ResourceKind::LoadBalancer => balancer::discover_load_balancers(cli, pattern).await,
            ResourceKind::TargetGroup => balancer::discover_target_groups(cli, pattern).await,
            ResourceKind::Listener => balancer::discover_listeners(cli, pattern).await,
            ResourceKind::OriginAccessIdentity => cdn::discover_oais(cli, pattern).await,
            ResourceKind::Distribution => cdn::discover_distributions(cli, pattern).await,
            ResourceKind::Instance => compute::discover(cli, pattern).await,
            other => Err(AwsError::Unsupported(format!("discovery of {}", other))),
        }
    }

    async fn release_any(&self, target: &ResourceDescriptor) -> Result<()> {
        let cli = &self.cli;
        let id = target.id_or_name();
        match target.kind {
            ResourceKind::Bucket => {
                let removed = storage::empty(cli, &target.name).await?;
                tracing::debug!("Removed {} object versions from {}", removed, target.name);
                Ok(())
            }
            ResourceKind::Role => iam::release_role(cli, &target.name).await,
            ResourceKind::InstanceProfile => iam::release_profile(cli, &target.name).await,
            ResourceKind::KnowledgeBase => knowledge::release(cli, id).await,
            ResourceKind::NatGateway => network::release_nat_routes(cli, id).await,
            ResourceKind::RouteTable => network::disassociate_route_table(cli, id).await,
            ResourceKind::SecurityGroup => network::release_security_group(cli, id).await,
            ResourceKind::Vpc => {
                let project = target.name.strip_prefix(VPC_PREFIX).unwrap_or(&target.name);
                network::release_vpc(cli, id, project).await
            }
            ResourceKind::LoadBalancer => balancer::release_load_balancer(cli, target).await,
            ResourceKind::Distribution => cdn::set_enabled(cli, id, false).await,
            _ => Ok(()),
        }
    }

    async fn delete_any(&self, target: &ResourceDescriptor) -> Result<()> {
        let cli = &self.cli;
        let id = target.id_or_name();
        match target.kind {
            ResourceKind::Bucket => storage::delete(cli, &target.name).await,
            ResourceKind::Role => iam::delete_role(cli, &target.name).await,
            ResourceKind::InstanceProfile => iam::delete_profile(cli, &target.name).await,
            ResourceKind::Secret => secrets::delete(cli, id).await,
            ResourceKind::SecurityPolicy => search::delete_security_policy(cli, target).await,
            ResourceKind::AccessPolicy => search::delete_access_policy(cli, &target.name).await,
            ResourceKind::Collection => search::delete_collection(cli, id).await,
            ResourceKind::KnowledgeBase => knowledge::delete(cli, id).await,
            ResourceKind::DataSource => knowledge::delete_data_source(cli, target).await,
            ResourceKind::Vpc
            | ResourceKind::Subnet
            | ResourceKind::InternetGateway
            | ResourceKind::NatGateway
            | ResourceKind::RouteTable
            | ResourceKind::SecurityGroup
            | ResourceKind::VpcEndpoint => network::delete(cli, target).await,
            ResourceKind::LoadBalancer => balancer::delete_load_balancer(cli, id).await,
            ResourceKind::TargetGroup => balancer::delete_target_group(cli, id).await,
            ResourceKind::Listener => balancer::delete_listener(cli, id).await,
            ResourceKind::ListenerRule => balancer::delete_rule(cli, id).await,
            ResourceKind::OriginAccessIdentity => cdn::delete_oai(cli, id).await,
            ResourceKind::Distribution => cdn::delete_distribution(cli, id).await,
            ResourceKind::Instance => compute::terminate(cli, id).await,
            ResourceKind::VectorIndex => Err(AwsError::Unsupported(
                "vector indexes are removed with their collection".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn name(&self) -> &str {
        "aws"
    }

    async fn check_auth(&self) -> agentstack_cloud::Result<AuthStatus> {
        match self.caller_identity().await {
            Ok(status) => Ok(status),
            Err(AwsError::CliNotFound) => Ok(AuthStatus::failed(
                "aws CLI not found. Install it and run `aws configure`",
            )),
            Err(e) => Ok(AuthStatus::failed(e.to_string())),
        }
    }

    async fn find(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> agentstack_cloud::Result<Option<ResourceDescriptor>> {
        Ok(self.find_any(kind, name).await?)
    }

    async fn create(&self, spec: &ResourceSpec) -> agentstack_cloud::Result<ResourceDescriptor> {
        tracing::debug!("Creating {} {}", spec.kind(), spec.name());
        Ok(self.create_any(spec).await?)
    }

    async fn apply(&self, setting: &Setting) -> agentstack_cloud::Result<()> {
        tracing::debug!("Applying {}", setting.describe());
        Ok(self.apply_any(setting).await?)
    }

    async fn status(&self, kind: ResourceKind, id: &str) -> agentstack_cloud::Result<String> {
        Ok(self.status_of(kind, id).await?)
    }

    async fn existing_cidrs(&self) -> agentstack_cloud::Result<Vec<String>> {
        Ok(network::existing_cidrs(&self.cli).await?)
    }

    async fn availability_zones(&self) -> agentstack_cloud::Result<Vec<String>> {
        Ok(network::availability_zones(&self.cli).await?)
    }

    async fn network_snapshot(&self, vpc_id: &str) -> agentstack_cloud::Result<NetworkSnapshot> {
        Ok(network::snapshot(&self.cli, vpc_id).await?)
    }

    async fn latest_image(
        &self,
        name_patterns: &[&str],
    ) -> agentstack_cloud::Result<Option<String>> {
        Ok(compute::latest_image(&self.cli, name_patterns).await?)
    }

    async fn discover(
        &self,
        kind: ResourceKind,
        pattern: &str,
    ) -> agentstack_cloud::Result<Vec<ResourceDescriptor>> {
        Ok(self.discover_any(kind, pattern).await?)
    }

    async fn release(&self, target: &ResourceDescriptor) -> agentstack_cloud::Result<()> {
        Ok(self.release_any(target).await?)
    }

    async fn detach_references(
        &self,
        groups: &[ResourceDescriptor],
    ) -> agentstack_cloud::Result<usize> {
        Ok(network::detach_references(&self.cli, groups).await?)
    }

    async fn delete(&self, target: &ResourceDescriptor) -> agentstack_cloud::Result<()> {
        Ok(self.delete_any(target).await?)
    }
}

#[async_trait]
impl RemoteShell for AwsProvider {
    async fn is_managed(&self, instance_id: &str) -> agentstack_cloud::Result<bool> {
        Ok(compute::is_managed(&self.cli, instance_id).await?)
    }

    async fn send_script(
        &self,
        instance_id: &str,
        script: &str,
        comment: &str,
    ) -> agentstack_cloud::Result<String> {
        Ok(compute::send_script(&self.cli, instance_id, script, comment).await?)
    }

    async fn invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> agentstack_cloud::Result<Invocation> {
        Ok(compute::invocation(&self.cli, command_id, instance_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_cli_reports_unauthenticated() {
        let cli = AwsCli::new("us-west-2").with_program("agentstack-test-no-such-aws-binary");
        let provider = AwsProvider::with_cli(cli).unwrap();
        let status = provider.check_auth().await.unwrap();
        assert!(!status.authenticated);
        assert!(status.error.unwrap().contains("aws CLI not found"));
    }

    #[tokio::test]
    async fn test_missing_cli_maps_to_command_failed() {
        let cli = AwsCli::new("us-west-2").with_program("agentstack-test-no-such-aws-binary");
        let provider = AwsProvider::with_cli(cli).unwrap();
        let err = provider
            .find(ResourceKind::Role, "role-ec2-for-demo-us-west-2")
            .await
            .unwrap_err();
        assert!(matches!(err, agentstack_cloud::CloudError::CommandFailed(_)));
    }

    #[tokio::test]
    async fn test_vector_index_delete_is_unsupported() {
        let provider = AwsProvider::new("us-west-2").unwrap();
        let index = search::index_descriptor("demo", "https://abc.us-west-2.aoss.amazonaws.com");
        let err = provider.delete(&index).await.unwrap_err();
        assert!(err.to_string().contains("removed with their collection"));
    }
}
