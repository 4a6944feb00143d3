//! Provisioning orchestrator
//!
//! Eleven stages, run in order, each returning typed outputs consumed by the
//! later ones. Every resource goes through [`ensure`], so re-running after a
//! partial failure picks up where the previous run stopped.

use crate::error::{DeployError, Result};
use crate::naming::{
    CUSTOM_HEADER_NAME, DOCS_PREFIX, EMBEDDING_DIMENSIONS, RunConfig, STATIC_PATHS, TOTAL_STAGES,
};
use crate::network::validate_load_balancer_subnets;
use crate::policies;
use crate::prompt::SecretPrompt;
use crate::readiness::{HttpProbe, Readiness, check_application_ready};
use crate::user_data::{encode_user_data, render_setup_script};
use agentstack_cloud::{
    CloudError, CloudProvider, ConfigStore, DeploymentConfig, Ensured, InlinePolicy, PolicyType,
    PollPolicy, ResourceDescriptor, ResourceKind, ResourceSpec, RetryConfig, Setting, SubnetInfo,
    TerminalStates, attr, await_absent, await_active, delete_with_retry, ensure, with_retry,
};
use secrecy::ExposeSecret;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ECS_IMAGE: &str = "al2023-ami-ecs-hvm-2023*-x86_64";
const STANDARD_IMAGE: &str = "al2023-ami-2023*-x86_64";

/// Poll intervals, timeouts and settle pauses per resource type
#[derive(Debug, Clone)]
pub struct StageTimings {
    pub collection: PollPolicy,
    pub knowledge_base: PollPolicy,
    pub knowledge_base_deletion: PollPolicy,
    pub nat_gateway: PollPolicy,
    pub subnet: PollPolicy,
    pub instance: PollPolicy,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    /// After new search policies, before the collection
    pub after_policies: Duration,
    /// After a new collection turns active
    pub after_collection: Duration,
    /// After a new vector index, before the knowledge base
    pub after_index: Duration,
    /// After a new origin access identity, before the bucket policy
    pub after_oai: Duration,
}

impl Default for StageTimings {
    fn default() -> Self {
        let ten = Duration::from_secs(10);
        let ten_minutes = Duration::from_secs(600);
        Self {
            collection: PollPolicy::new(ten, ten_minutes),
            knowledge_base: PollPolicy::new(ten, ten_minutes),
            knowledge_base_deletion: PollPolicy::new(
                Duration::from_secs(5),
                Duration::from_secs(60),
            ),
            nat_gateway: PollPolicy::new(ten, ten_minutes),
            subnet: PollPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
            instance: PollPolicy::new(ten, ten_minutes),
            readiness_attempts: 120,
            readiness_interval: ten,
            after_policies: Duration::from_secs(5),
            after_collection: Duration::from_secs(30),
            after_index: Duration::from_secs(30),
            after_oai: ten,
        }
    }
}

impl StageTimings {
    /// No waiting at all; tests and `--dry-run`
    pub fn immediate() -> Self {
        Self {
            collection: PollPolicy::immediate(5),
            knowledge_base: PollPolicy::immediate(5),
            knowledge_base_deletion: PollPolicy::immediate(5),
            nat_gateway: PollPolicy::immediate(5),
            subnet: PollPolicy::immediate(5),
            instance: PollPolicy::immediate(5),
            readiness_attempts: 3,
            readiness_interval: Duration::ZERO,
            after_policies: Duration::ZERO,
            after_collection: Duration::ZERO,
            after_index: Duration::ZERO,
            after_oai: Duration::ZERO,
        }
    }
}

// ---- stage outputs ----

#[derive(Debug, Clone)]
pub struct StorageOutput {
    pub bucket: String,
    pub bucket_arn: String,
    pub bucket_domain: String,
}

#[derive(Debug, Clone)]
pub struct Identities {
    pub knowledge_base_role_arn: String,
    pub agent_role_arn: String,
    pub compute_role_arn: String,
    pub instance_profile: String,
}

#[derive(Debug, Clone)]
pub struct SecretArns {
    pub weather: String,
    pub tavily: String,
}

#[derive(Debug, Clone)]
pub struct SearchCollection {
    pub id: String,
    pub arn: String,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    pub id: String,
    pub data_source_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkLayout {
    pub vpc_id: String,
    pub cidr: String,
    pub public_subnets: Vec<SubnetInfo>,
    pub private_subnets: Vec<SubnetInfo>,
    pub alb_security_group: String,
    pub compute_security_group: String,
    pub endpoint_id: Option<String>,
    /// The VPC existed before this run
    pub reused: bool,
}

impl NetworkLayout {
    pub fn public_ids(&self) -> Vec<String> {
        self.public_subnets.iter().map(|s| s.id.clone()).collect()
    }

    pub fn private_ids(&self) -> Vec<String> {
        self.private_subnets.iter().map(|s| s.id.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pub arn: String,
    pub dns: String,
}

#[derive(Debug, Clone)]
pub struct Distribution {
    pub id: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct ComputeInstance {
    pub id: String,
    pub subnet_id: String,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct Routing {
    pub target_group_arn: String,
    pub listener_arn: String,
    pub rule_arn: String,
}

/// Everything a successful run produced
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub storage: StorageOutput,
    pub identities: Identities,
    pub secrets: SecretArns,
    pub collection: SearchCollection,
    pub knowledge_base: KnowledgeBase,
    pub network: NetworkLayout,
    pub load_balancer: LoadBalancer,
    pub distribution: Distribution,
    pub instance: ComputeInstance,
    pub routing: Routing,
    pub readiness: Readiness,
    pub config: DeploymentConfig,
    pub elapsed: Duration,
}

/// Log the stage header and tag any failure with the stage number
async fn stage<T>(
    number: u8,
    title: &'static str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    info!(stage = number, "[{}/{}] {}", number, TOTAL_STAGES, title);
    work.await.map_err(|source| DeployError::Stage {
        stage: number,
        title,
        source: Box::new(source),
    })
}

pub(crate) fn arn_of(descriptor: &ResourceDescriptor) -> Result<String> {
    descriptor
        .arn
        .clone()
        .ok_or_else(|| DeployError::missing(descriptor.label(), "arn"))
}

pub(crate) fn id_of(descriptor: &ResourceDescriptor) -> Result<String> {
    descriptor
        .id
        .clone()
        .ok_or_else(|| DeployError::missing(descriptor.label(), "id"))
}

pub(crate) fn attr_of(descriptor: &ResourceDescriptor, key: &'static str) -> Result<String> {
    descriptor
        .attr_str(key)
        .map(str::to_string)
        .ok_or_else(|| DeployError::missing(descriptor.label(), key))
}

pub struct Provisioner<'a> {
    pub(crate) provider: &'a dyn CloudProvider,
    pub(crate) run: RunConfig,
    pub(crate) timings: StageTimings,
    pub(crate) retry: RetryConfig,
    store: ConfigStore,
    prompt: &'a dyn SecretPrompt,
    probe: &'a dyn HttpProbe,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        provider: &'a dyn CloudProvider,
        run: RunConfig,
        store: ConfigStore,
        prompt: &'a dyn SecretPrompt,
        probe: &'a dyn HttpProbe,
    ) -> Self {
        Self {
            provider,
            run,
            timings: StageTimings::default(),
            retry: RetryConfig::throttling(),
            store,
            prompt,
            probe,
        }
    }

    pub fn with_timings(mut self, timings: StageTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    /// Execute all stages; the first fatal error aborts the run
    pub async fn run(&self) -> Result<ProvisionOutcome> {
        let started = Instant::now();
        info!(
            project = %self.run.project_name,
            region = %self.run.region,
            account = %self.run.account_id,
            bucket = %self.run.bucket_name(),
            "Starting infrastructure deployment"
        );

        let storage = stage(1, "Creating S3 bucket", self.storage()).await?;
        let identities = stage(2, "Creating IAM roles", self.identities()).await?;
        let secrets = stage(3, "Creating Secrets Manager secrets", self.secrets()).await?;
        let collection = stage(
            4,
            "Creating OpenSearch Serverless collection",
            self.search(&identities),
        )
        .await?;
        let knowledge_base = stage(
            5,
            "Creating knowledge base",
            self.knowledge_base(&identities, &collection, &storage),
        )
        .await?;
        let network = stage(6, "Creating VPC and networking resources", self.network()).await?;
        let load_balancer = stage(
            7,
            "Creating Application Load Balancer",
            self.load_balancer(&network),
        )
        .await?;
        let distribution = stage(
            8,
            "Creating CloudFront distribution",
            self.distribution(&load_balancer, &storage),
        )
        .await?;

        let mut config = self.deployment_config(
            &storage,
            &identities,
            &collection,
            &knowledge_base,
            &network,
            &load_balancer,
            &distribution,
        );
        let instance = stage(
            9,
            "Creating EC2 instance",
            self.instance(&network, &identities, &config),
        )
        .await?;
        config.instance_id = Some(instance.id.clone());

        let routing = stage(
            10,
            "Creating ALB target group and listener",
            self.routing(&network, &load_balancer, &instance),
        )
        .await?;
        let readiness = stage(
            11,
            "Checking application readiness",
            check_application_ready(
                self.probe,
                &distribution.domain,
                self.timings.readiness_attempts,
                self.timings.readiness_interval,
            ),
        )
        .await?;

        let config = self.store.merge_and_save(&config).await?;
        info!("✓ Updated {}", self.store.path().display());

        Ok(ProvisionOutcome {
            storage,
            identities,
            secrets,
            collection,
            knowledge_base,
            network,
            load_balancer,
            distribution,
            instance,
            routing,
            readiness,
            config,
            elapsed: started.elapsed(),
        })
    }

    // ---- helpers ----

    pub(crate) async fn ensure(&self, spec: ResourceSpec) -> Result<Ensured> {
        let ensured = ensure(self.provider, &spec, &self.retry).await?;
        if ensured.was_created() {
            info!("  ✓ Created {} {}", spec.kind(), spec.name());
        } else {
            warn!("  {} already exists: {}", spec.kind(), spec.name());
        }
        Ok(ensured)
    }

    pub(crate) async fn apply(&self, setting: Setting) -> Result<()> {
        let what = setting.describe();
        with_retry(&what, &self.retry, || self.provider.apply(&setting)).await?;
        debug!("  Applied {}", what);
        Ok(())
    }

    pub(crate) async fn find(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ResourceDescriptor>> {
        Ok(with_retry(name, &self.retry, || self.provider.find(kind, name)).await?)
    }

    pub(crate) async fn pause(&self, duration: Duration, reason: &str) {
        if !duration.is_zero() {
            debug!("  Waiting {:?} for {}", duration, reason);
            tokio::time::sleep(duration).await;
        }
    }

    pub(crate) async fn await_status(
        &self,
        kind: ResourceKind,
        id: &str,
        policy: &PollPolicy,
        terminal: &TerminalStates,
    ) -> Result<String> {
        let what = format!("{} {}", kind, id);
        Ok(await_active(&what, policy, terminal, || self.provider.status(kind, id)).await?)
    }

    // ---- stage 1 ----

    async fn storage(&self) -> Result<StorageOutput> {
        let bucket = self
            .ensure(ResourceSpec::Bucket {
                name: self.run.bucket_name(),
            })
            .await?
            .into_descriptor();
        self.apply(Setting::BucketDefaults {
            bucket: bucket.name.clone(),
        })
        .await?;

        Ok(StorageOutput {
            bucket_arn: bucket.arn.clone().unwrap_or_else(|| self.run.bucket_arn()),
            bucket_domain: bucket
                .attr_str(attr::DOMAIN_NAME)
                .map(str::to_string)
                .unwrap_or_else(|| self.run.bucket_domain()),
            bucket: bucket.name,
        })
    }

    // ---- stage 2 ----

    async fn role(
        &self,
        name: String,
        trust_policy: serde_json::Value,
        managed: &[&str],
        inline: Vec<InlinePolicy>,
    ) -> Result<String> {
        let role = self
            .ensure(ResourceSpec::Role {
                description: format!("Role for {}", name),
                name: name.clone(),
                trust_policy,
            })
            .await?
            .into_descriptor();

        for policy_arn in managed {
            self.apply(Setting::RoleManagedPolicy {
                role: name.clone(),
                policy_arn: policy_arn.to_string(),
            })
            .await?;
        }
        for policy in inline {
            self.apply(Setting::RoleInlinePolicy {
                role: name.clone(),
                policy,
            })
            .await?;
        }
        arn_of(&role)
    }

    async fn identities(&self) -> Result<Identities> {
        let run = &self.run;
        let knowledge_base_role_arn = self
            .role(
                run.knowledge_base_role_name(),
                policies::bedrock_trust(),
                &[],
                policies::knowledge_base_policies(run),
            )
            .await?;
        let agent_role_arn = self
            .role(
                run.agent_role_name(),
                policies::bedrock_trust(),
                &policies::AGENT_MANAGED_POLICIES,
                policies::agent_policies(run),
            )
            .await?;
        let compute_role_arn = self
            .role(
                run.compute_role_name(),
                policies::compute_trust(),
                &policies::COMPUTE_MANAGED_POLICIES,
                policies::compute_policies(run, &knowledge_base_role_arn),
            )
            .await?;

        let instance_profile = run.instance_profile_name();
        self.ensure(ResourceSpec::InstanceProfile {
            name: instance_profile.clone(),
        })
        .await?;
        self.apply(Setting::InstanceProfileRole {
            profile: instance_profile.clone(),
            role: run.compute_role_name(),
        })
        .await?;

        Ok(Identities {
            knowledge_base_role_arn,
            agent_role_arn,
            compute_role_arn,
            instance_profile,
        })
    }

    // ---- stage 3 ----

    /// Probe first so the prompt only runs for secrets that are missing
    async fn secret(
        &self,
        name: String,
        description: &str,
        label: &str,
        field: &str,
    ) -> Result<String> {
        let descriptor = match self.find(ResourceKind::Secret, &name).await? {
            Some(existing) => {
                warn!("  Secret already exists: {}", name);
                existing
            }
            None => {
                let value = self.prompt.secret(&name, label)?;
                let payload = json!({
                    "project_name": self.run.project_name,
                    field: value.expose_secret(),
                });
                self.ensure(ResourceSpec::Secret {
                    name: name.clone(),
                    description: description.to_string(),
                    payload: payload.to_string(),
                })
                .await?
                .into_descriptor()
            }
        };
        descriptor
            .identifier()
            .map(str::to_string)
            .ok_or_else(|| DeployError::missing(name, "arn"))
    }

    async fn secrets(&self) -> Result<SecretArns> {
        let weather = self
            .secret(
                self.run.weather_secret_name(),
                "secret for weather api key",
                "Weather API Key (OpenWeatherMap)",
                "weather_api_key",
            )
            .await?;
        let tavily = self
            .secret(
                self.run.tavily_secret_name(),
                "secret for tavily api key",
                "Tavily API Key",
                "tavily_api_key",
            )
            .await?;
        Ok(SecretArns { weather, tavily })
    }

    // ---- stage 4 ----

    async fn search(&self, identities: &Identities) -> Result<SearchCollection> {
        let run = &self.run;
        let p = &run.project_name;

        let encryption = self
            .ensure(ResourceSpec::SecurityPolicy {
                name: run.encryption_policy_name(),
                policy_type: PolicyType::Encryption,
                document: policies::encryption_policy(run),
                description: format!("opensearch encryption policy for {}", p),
            })
            .await?;
        let network = self
            .ensure(ResourceSpec::SecurityPolicy {
                name: run.network_policy_name(),
                policy_type: PolicyType::Network,
                document: policies::network_policy(run),
                description: format!("opensearch network policy for {}", p),
            })
            .await?;

        let principals = policies::data_access_principals(
            run,
            &[&identities.compute_role_arn, &identities.knowledge_base_role_arn],
        );
        let data = self
            .ensure(ResourceSpec::AccessPolicy {
                name: run.data_policy_name(),
                document: policies::data_access_policy(run, &principals),
                description: format!("opensearch data access policy for {}", p),
            })
            .await?;
        if !data.was_created() {
            self.apply(Setting::AccessPolicyPrincipals {
                policy: run.data_policy_name(),
                principals,
            })
            .await?;
        }

        if encryption.was_created() || network.was_created() || data.was_created() {
            self.pause(self.timings.after_policies, "policies to propagate").await;
        }

        let created = self
            .ensure(ResourceSpec::Collection {
                name: run.collection_name(),
                description: format!("opensearch correction for {}", p),
            })
            .await?;
        let id = id_of(created.descriptor())?;
        self.await_status(
            ResourceKind::Collection,
            &id,
            &self.timings.collection,
            &TerminalStates::active_or_failed(),
        )
        .await?;
        if created.was_created() {
            self.pause(self.timings.after_collection, "the collection to settle").await;
        }

        // The endpoint is only reported once the collection is active
        let collection = match created.descriptor().attr_str(attr::ENDPOINT) {
            Some(_) => created.into_descriptor(),
            None => self
                .find(ResourceKind::Collection, &run.collection_name())
                .await?
                .ok_or_else(|| DeployError::missing(run.collection_name(), attr::ENDPOINT))?,
        };
        let endpoint = attr_of(&collection, attr::ENDPOINT)?;
        let arn = arn_of(&collection)?;
        info!("  OpenSearch collection ARN: {}", arn);

        let index = self
            .ensure(ResourceSpec::VectorIndex {
                name: run.vector_index_name(),
                endpoint: endpoint.clone(),
                body: policies::vector_index_body(),
            })
            .await?;
        if index.was_created() {
            self.pause(self.timings.after_index, "the vector index").await;
        }

        Ok(SearchCollection { id, arn, endpoint })
    }

    // ---- stage 5 ----

    /// Drop a knowledge base bound to another collection and wait until it is gone
    async fn remove_stale_knowledge_base(&self, stale: &ResourceDescriptor) -> Result<()> {
        warn!(
            "  Knowledge base {} uses collection {}, recreating",
            stale.name,
            stale.attr_str(attr::COLLECTION_ARN).unwrap_or("(none)")
        );
        self.provider.release(stale).await?;
        delete_with_retry(self.provider, stale, &self.retry).await?;

        let name = stale.name.clone();
        await_absent(
            &format!("knowledge base {}", name),
            &self.timings.knowledge_base_deletion,
            || self.provider.find(ResourceKind::KnowledgeBase, &name),
        )
        .await?;
        Ok(())
    }

    async fn knowledge_base(
        &self,
        identities: &Identities,
        collection: &SearchCollection,
        storage: &StorageOutput,
    ) -> Result<KnowledgeBase> {
        let run = &self.run;
        let name = run.knowledge_base_name();

        if let Some(existing) = self.find(ResourceKind::KnowledgeBase, &name).await? {
            if existing.attr_str(attr::COLLECTION_ARN) != Some(collection.arn.as_str()) {
                self.remove_stale_knowledge_base(&existing).await?;
            }
        }

        let kb = self
            .ensure(ResourceSpec::KnowledgeBase {
                name,
                description: "Knowledge base based on OpenSearch".to_string(),
                role_arn: identities.knowledge_base_role_arn.clone(),
                collection_arn: collection.arn.clone(),
                index_name: run.vector_index_name(),
                embedding_model_arn: run.embedding_model_arn(),
                dimensions: EMBEDDING_DIMENSIONS,
            })
            .await?
            .into_descriptor();
        let id = id_of(&kb)?;
        self.await_status(
            ResourceKind::KnowledgeBase,
            &id,
            &self.timings.knowledge_base,
            &TerminalStates::active_or_failed(),
        )
        .await?;

        let data_source = self
            .ensure(ResourceSpec::DataSource {
                name: run.data_source_name(),
                knowledge_base_id: id.clone(),
                bucket_arn: storage.bucket_arn.clone(),
                inclusion_prefixes: vec![DOCS_PREFIX.to_string()],
                parsing_model_arn: run.parsing_model_arn(),
            })
            .await?
            .into_descriptor();

        Ok(KnowledgeBase {
            id,
            data_source_id: data_source.id,
        })
    }

    // ---- stage 7 ----

    async fn load_balancer(&self, network: &NetworkLayout) -> Result<LoadBalancer> {
        let name = self.run.load_balancer_name();
        let descriptor = match self.find(ResourceKind::LoadBalancer, &name).await? {
            Some(existing) => {
                warn!("  ALB already exists: {}", name);
                existing
            }
            None => {
                let subnet_ids = validate_load_balancer_subnets(&network.public_subnets)?;
                self.ensure(ResourceSpec::LoadBalancer {
                    name,
                    subnet_ids,
                    security_group_ids: vec![network.alb_security_group.clone()],
                })
                .await?
                .into_descriptor()
            }
        };

        Ok(LoadBalancer {
            arn: arn_of(&descriptor)?,
            dns: attr_of(&descriptor, attr::DNS_NAME)?,
        })
    }

    // ---- stage 8 ----

    async fn distribution(
        &self,
        load_balancer: &LoadBalancer,
        storage: &StorageOutput,
    ) -> Result<Distribution> {
        let run = &self.run;

        if let Some(existing) = self
            .find(ResourceKind::Distribution, &run.distribution_name())
            .await?
        {
            let id = id_of(&existing)?;
            warn!("  CloudFront distribution already exists: {}", id);
            if existing.attribute::<bool>(attr::ENABLED) == Some(false) {
                info!("  Re-enabling disabled distribution {}", id);
                self.apply(Setting::EnableDistribution {
                    distribution_id: id.clone(),
                })
                .await?;
            }
            return Ok(Distribution {
                domain: attr_of(&existing, attr::DOMAIN_NAME)?,
                id,
            });
        }

        let oai = self
            .ensure(ResourceSpec::OriginAccessIdentity {
                name: run.origin_access_identity_name(),
            })
            .await?;
        if oai.was_created() {
            self.pause(self.timings.after_oai, "the origin access identity").await;
        }
        let oai_id = id_of(oai.descriptor())?;

        self.apply(Setting::BucketPolicy {
            bucket: storage.bucket.clone(),
            policy: policies::bucket_policy(&storage.bucket, &oai_id),
        })
        .await?;

        let distribution = self
            .ensure(ResourceSpec::Distribution {
                name: run.distribution_name(),
                project_name: run.project_name.clone(),
                alb_dns: load_balancer.dns.clone(),
                bucket_domain: storage.bucket_domain.clone(),
                oai_id,
                static_paths: STATIC_PATHS.iter().map(|p| p.to_string()).collect(),
            })
            .await?
            .into_descriptor();

        Ok(Distribution {
            id: id_of(&distribution)?,
            domain: attr_of(&distribution, attr::DOMAIN_NAME)?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn deployment_config(
        &self,
        storage: &StorageOutput,
        identities: &Identities,
        collection: &SearchCollection,
        knowledge_base: &KnowledgeBase,
        network: &NetworkLayout,
        load_balancer: &LoadBalancer,
        distribution: &Distribution,
    ) -> DeploymentConfig {
        DeploymentConfig {
            project_name: Some(self.run.project_name.clone()),
            account_id: Some(self.run.account_id.clone()),
            region: Some(self.run.region.clone()),
            knowledge_base_id: Some(knowledge_base.id.clone()),
            knowledge_base_role: Some(identities.knowledge_base_role_arn.clone()),
            collection_arn: Some(collection.arn.clone()),
            opensearch_url: Some(collection.endpoint.clone()),
            s3_bucket: Some(storage.bucket.clone()),
            s3_arn: Some(storage.bucket_arn.clone()),
            sharing_url: Some(format!("https://{}", distribution.domain)),
            vpc_id: Some(network.vpc_id.clone()),
            alb_dns: Some(load_balancer.dns.clone()),
            cloudfront_domain: Some(distribution.domain.clone()),
            extra: BTreeMap::from([(
                "custom_header_value".to_string(),
                json!(self.run.header_value()),
            )]),
            ..Default::default()
        }
    }

    // ---- stage 9 ----

    async fn instance(
        &self,
        network: &NetworkLayout,
        identities: &Identities,
        config: &DeploymentConfig,
    ) -> Result<ComputeInstance> {
        let run = &self.run;
        let name = run.instance_name();

        if let Some(existing) = self.find(ResourceKind::Instance, &name).await? {
            let id = id_of(&existing)?;
            warn!(
                "  EC2 instance already exists: {} ({})",
                id,
                existing.attr_str(attr::STATE).unwrap_or("unknown")
            );
            return Ok(ComputeInstance {
                subnet_id: existing.attr_str(attr::SUBNET_ID).unwrap_or_default().to_string(),
                id,
                reused: true,
            });
        }

        let subnet_id = network
            .private_subnets
            .first()
            .map(|s| s.id.clone())
            .ok_or_else(|| {
                CloudError::Precondition(format!(
                    "no private subnet in {} for the instance",
                    network.vpc_id
                ))
            })?;
        let image_id = self
            .provider
            .latest_image(&[ECS_IMAGE, STANDARD_IMAGE])
            .await?
            .ok_or_else(|| {
                CloudError::Precondition(
                    "no Amazon Linux 2023 image found".to_string(),
                )
            })?;
        debug!("  Using image {}", image_id);

        let script = render_setup_script(run, &config.environment())?;
        let instance = self
            .ensure(ResourceSpec::Instance {
                name,
                image_id,
                instance_type: run.instance_type.clone(),
                subnet_id: subnet_id.clone(),
                security_group_ids: vec![network.compute_security_group.clone()],
                instance_profile: identities.instance_profile.clone(),
                volume_size_gb: run.volume_size_gb,
                user_data: encode_user_data(&script),
            })
            .await?
            .into_descriptor();

        Ok(ComputeInstance {
            id: id_of(&instance)?,
            subnet_id,
            reused: false,
        })
    }

    // ---- stage 10 ----

    async fn routing(
        &self,
        network: &NetworkLayout,
        load_balancer: &LoadBalancer,
        instance: &ComputeInstance,
    ) -> Result<Routing> {
        let run = &self.run;

        let target_group = self
            .ensure(ResourceSpec::TargetGroup {
                name: run.target_group_name(),
                vpc_id: network.vpc_id.clone(),
                port: run.app_port,
                health_check_path: "/".to_string(),
            })
            .await?
            .into_descriptor();
        let target_group_arn = arn_of(&target_group)?;

        info!("  Waiting for instance {} to be running", instance.id);
        self.await_status(
            ResourceKind::Instance,
            &instance.id,
            &self.timings.instance,
            &TerminalStates::running(),
        )
        .await?;
        self.apply(Setting::TargetRegistration {
            target_group_arn: target_group_arn.clone(),
            instance_id: instance.id.clone(),
            port: run.app_port,
        })
        .await?;

        let listener = self
            .ensure(ResourceSpec::Listener {
                name: run.listener_name(),
                load_balancer_arn: load_balancer.arn.clone(),
                target_group_arn: target_group_arn.clone(),
                port: 80,
            })
            .await?
            .into_descriptor();
        let listener_arn = arn_of(&listener)?;

        debug!(header = CUSTOM_HEADER_NAME, value = %run.header_value(), "Listener rule header");
        let rule = self
            .ensure(ResourceSpec::ListenerRule {
                name: run.listener_rule_name(),
                listener_arn: listener_arn.clone(),
                target_group_arn: target_group_arn.clone(),
                priority: 10,
                header_name: CUSTOM_HEADER_NAME.to_string(),
                header_value: run.header_value(),
            })
            .await?
            .into_descriptor();

        Ok(Routing {
            target_group_arn,
            listener_arn,
            rule_arn: rule.identifier().unwrap_or_default().to_string(),
        })
    }
}
