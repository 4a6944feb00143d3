mod common;

use agentstack_cloud::{
    CallOp, CloudProvider, MemoryProvider, ResourceDescriptor, ResourceKind, ResourceSpec,
    RouteTarget, Setting, attr,
};
use agentstack_deploy::{DeployError, Readiness, Result, SecretPrompt};
use common::{ACCOUNT, TestEnv};
use secrecy::SecretString;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingPrompt(AtomicUsize);

impl SecretPrompt for CountingPrompt {
    fn secret(&self, _secret_name: &str, _label: &str) -> Result<SecretString> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(SecretString::from("key-from-prompt".to_string()))
    }
}

fn create_count(provider: &MemoryProvider) -> usize {
    provider
        .calls()
        .iter()
        .filter(|c| c.op == CallOp::Create)
        .count()
}

#[tokio::test]
async fn test_full_provision() {
    let env = TestEnv::new();
    let outcome = env.provision().await.unwrap();

    assert_eq!(outcome.readiness, Readiness::Ready(200));
    assert_eq!(outcome.storage.bucket, format!("storage-for-demo-{}-us-west-2", ACCOUNT));
    assert!(outcome.distribution.domain.ends_with(".cloudfront.net"));

    let network = &outcome.network;
    assert!(!network.reused);
    assert_eq!(network.cidr, "10.20.0.0/16");
    let cidrs = |subnets: &[agentstack_cloud::SubnetInfo]| {
        subnets.iter().map(|s| s.cidr.clone()).collect::<Vec<_>>()
    };
    assert_eq!(cidrs(&network.public_subnets), ["10.20.0.0/24", "10.20.1.0/24"]);
    assert_eq!(cidrs(&network.private_subnets), ["10.20.2.0/24", "10.20.3.0/24"]);
    assert_eq!(outcome.instance.subnet_id, network.private_subnets[0].id);
    assert!(!outcome.instance.reused);

    // Stage order
    let provider = &env.provider;
    let order = [
        ResourceKind::Bucket,
        ResourceKind::Role,
        ResourceKind::Secret,
        ResourceKind::Collection,
        ResourceKind::KnowledgeBase,
        ResourceKind::Vpc,
        ResourceKind::LoadBalancer,
        ResourceKind::Distribution,
        ResourceKind::Instance,
        ResourceKind::TargetGroup,
        ResourceKind::Listener,
        ResourceKind::ListenerRule,
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|kind| provider.position(CallOp::Create, *kind).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);

    // The instance is registered with the target group once running
    assert!(provider.applied().iter().any(|s| matches!(
        s,
        Setting::TargetRegistration { instance_id, port: 8501, .. }
            if *instance_id == outcome.instance.id
    )));

    let stored = env.store().load().await.unwrap();
    assert_eq!(stored.project_name.as_deref(), Some("demo"));
    assert_eq!(stored.knowledge_base_id.as_deref(), Some(outcome.knowledge_base.id.as_str()));
    assert_eq!(
        stored.sharing_url,
        Some(format!("https://{}", outcome.distribution.domain))
    );
    assert_eq!(stored.instance_id.as_deref(), Some(outcome.instance.id.as_str()));
    assert_eq!(stored.environment().len(), 10);
}

#[tokio::test]
async fn test_rerun_creates_nothing() {
    let env = TestEnv::new();
    let first = env.provision().await.unwrap();
    let creates = create_count(&env.provider);

    let second = env.provision().await.unwrap();

    assert_eq!(create_count(&env.provider), creates);
    assert!(second.network.reused);
    assert!(second.instance.reused);
    assert_eq!(second.instance.id, first.instance.id);
    assert_eq!(second.knowledge_base.id, first.knowledge_base.id);
    assert_eq!(second.distribution.domain, first.distribution.domain);
}

#[tokio::test]
async fn test_existing_secrets_are_not_prompted() {
    let env = TestEnv::new();
    let run = env.run_config();
    for name in [run.weather_secret_name(), run.tavily_secret_name()] {
        env.provider.insert(
            ResourceDescriptor::new(ResourceKind::Secret, name.as_str())
                .with_arn(format!("arn:aws:secretsmanager:us-west-2:{}:secret:{}", ACCOUNT, name)),
        );
    }

    let prompt = CountingPrompt(AtomicUsize::new(0));
    env.provision_with(&prompt).await.unwrap();

    assert_eq!(prompt.0.load(Ordering::SeqCst), 0);
    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::Secret), 0);
}

#[tokio::test]
async fn test_missing_secrets_are_prompted_once_each() {
    let env = TestEnv::new();
    let prompt = CountingPrompt(AtomicUsize::new(0));
    env.provision_with(&prompt).await.unwrap();

    assert_eq!(prompt.0.load(Ordering::SeqCst), 2);
    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::Secret), 2);
}

#[tokio::test]
async fn test_knowledge_base_on_wrong_collection_is_recreated() {
    let env = TestEnv::new();
    env.provider.insert(
        ResourceDescriptor::new(ResourceKind::KnowledgeBase, env.run_config().knowledge_base_name())
            .with_id("kb-stale")
            .with_attribute(
                attr::COLLECTION_ARN,
                json!("arn:aws:aoss:us-west-2:123456789012:collection/old"),
            ),
    );

    let outcome = env.provision().await.unwrap();

    let provider = &env.provider;
    assert_eq!(provider.count(CallOp::Delete, ResourceKind::KnowledgeBase), 1);
    assert_eq!(provider.count(CallOp::Create, ResourceKind::KnowledgeBase), 1);
    assert_ne!(outcome.knowledge_base.id, "kb-stale");

    let current = provider
        .get(ResourceKind::KnowledgeBase, &env.run_config().knowledge_base_name())
        .unwrap();
    assert_eq!(
        current.attr_str(attr::COLLECTION_ARN),
        Some(outcome.collection.arn.as_str())
    );
}

#[tokio::test]
async fn test_throttled_creates_are_retried() {
    let env = TestEnv::new();
    env.provider.throttle_next_creates(ResourceKind::Bucket, 2);

    env.provision().await.unwrap();

    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::Bucket), 3);
}

#[tokio::test]
async fn test_failed_stage_aborts_the_run() {
    let env = TestEnv::new();
    env.provider.script_status(ResourceKind::Collection, &["CREATING", "FAILED"]);

    let err = env.provision().await.unwrap_err();

    assert!(matches!(err, DeployError::Stage { stage: 4, .. }), "{}", err);
    assert!(err.to_string().starts_with("[4/11] Creating OpenSearch Serverless collection failed"));
    assert!(err.cloud().is_some());

    // Nothing after stage 4 ran, and nothing was persisted
    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::KnowledgeBase), 0);
    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::Vpc), 0);
    assert!(!env.store().path().exists());
}

#[tokio::test]
async fn test_busy_address_space_moves_to_next_block() {
    let provider = MemoryProvider::new().with_existing_cidrs(&["10.20.0.0/16", "10.21.0.0/16"]);
    let env = TestEnv::with_provider(provider);

    let outcome = env.provision().await.unwrap();

    assert_eq!(outcome.network.cidr, "10.22.0.0/16");
    assert_eq!(outcome.network.public_subnets[0].cidr, "10.22.0.0/24");
}

#[tokio::test]
async fn test_rejected_subnet_block_skips_the_zone() {
    let env = TestEnv::new();
    env.provider.reject_subnet_block("10.20.3.0/24");

    let outcome = env.provision().await.unwrap();

    let network = &outcome.network;
    assert_eq!(network.public_subnets.len(), 2);
    let private: Vec<_> = network.private_subnets.iter().map(|s| s.cidr.as_str()).collect();
    assert_eq!(private, ["10.20.2.0/24"]);
    assert_eq!(outcome.instance.subnet_id, network.private_subnets[0].id);
    assert!(
        env.provider
            .resources_of(ResourceKind::Subnet)
            .iter()
            .all(|s| s.attr_str(attr::CIDR) != Some("10.20.3.0/24"))
    );
}

#[tokio::test]
async fn test_disabled_distribution_is_re_enabled() {
    let env = TestEnv::new();
    let first = env.provision().await.unwrap();
    let name = env.run_config().distribution_name();

    // An uninstall that stopped after disabling it
    let distribution = env.provider.get(ResourceKind::Distribution, &name).unwrap();
    env.provider.release(&distribution).await.unwrap();
    let disabled = env.provider.get(ResourceKind::Distribution, &name).unwrap();
    assert_eq!(disabled.attribute::<bool>(attr::ENABLED), Some(false));

    let second = env.provision().await.unwrap();

    assert_eq!(second.distribution.id, first.distribution.id);
    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::Distribution), 1);
    assert!(env.provider.applied().iter().any(|s| matches!(
        s,
        Setting::EnableDistribution { distribution_id } if *distribution_id == first.distribution.id
    )));
    let enabled = env.provider.get(ResourceKind::Distribution, &name).unwrap();
    assert_eq!(enabled.attribute::<bool>(attr::ENABLED), Some(true));
}

/// A VPC that already has two public subnets but nothing private
async fn existing_vpc(env: &TestEnv, zones: [&str; 2]) -> String {
    let run = env.run_config();
    let vpc = env
        .provider
        .create(&ResourceSpec::Vpc {
            name: run.vpc_name(),
            cidr: "10.30.0.0/16".into(),
        })
        .await
        .unwrap();
    let vpc_id = vpc.id.unwrap();

    for (i, zone) in zones.iter().enumerate() {
        env.provider
            .create(&ResourceSpec::Subnet {
                name: format!("web-public-{}", i),
                vpc_id: vpc_id.clone(),
                cidr: format!("10.30.{}.0/24", i),
                availability_zone: zone.to_string(),
                public: true,
            })
            .await
            .unwrap();
    }
    vpc_id
}

#[tokio::test]
async fn test_existing_vpc_gets_private_subnets() {
    let env = TestEnv::new();
    let vpc_id = existing_vpc(&env, ["us-west-2a", "us-west-2b"]).await;
    let main_table = env
        .provider
        .network_snapshot(&vpc_id)
        .await
        .unwrap()
        .main_route_table()
        .unwrap()
        .id
        .clone();

    let outcome = env.provision().await.unwrap();
    let network = &outcome.network;

    assert!(network.reused);
    assert_eq!(network.vpc_id, vpc_id);
    assert_eq!(network.public_subnets.len(), 2);
    let private: Vec<_> = network.private_subnets.iter().map(|s| s.cidr.as_str()).collect();
    assert_eq!(private, ["10.30.2.0/24", "10.30.3.0/24"]);
    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::NatGateway), 1);

    // The main table gains a default route through the gateway
    assert!(env.provider.applied().iter().any(|s| matches!(
        s,
        Setting::Route { route_table_id, target: RouteTarget::InternetGateway(_), .. }
            if *route_table_id == main_table
    )));
}

#[tokio::test]
async fn test_single_zone_public_subnets_stop_the_load_balancer() {
    let env = TestEnv::new();
    existing_vpc(&env, ["us-west-2a", "us-west-2a"]).await;

    let err = env.provision().await.unwrap_err();

    assert!(matches!(err, DeployError::Stage { stage: 7, .. }), "{}", err);
    assert!(err.to_string().contains("at least 2 different availability zones"));
    assert_eq!(env.provider.count(CallOp::Create, ResourceKind::LoadBalancer), 0);
}
