mod common;

use agentstack_cloud::{CallOp, ResourceKind};
use agentstack_deploy::DISCOVERY;
use common::TestEnv;

#[tokio::test]
async fn test_teardown_on_empty_account() {
    let env = TestEnv::new();
    let report = env.teardown().await;

    assert!(report.is_success());
    assert_eq!(report.deleted_count(), 0);
    assert_eq!(env.provider.count(CallOp::Delete, ResourceKind::Vpc), 0);
}

#[tokio::test]
async fn test_teardown_removes_provisioned_resources() {
    let env = TestEnv::new();
    env.provision().await.unwrap();

    let report = env.teardown().await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert!(report.deleted_count() > 20);

    for kind in [
        ResourceKind::Bucket,
        ResourceKind::Role,
        ResourceKind::InstanceProfile,
        ResourceKind::Secret,
        ResourceKind::SecurityPolicy,
        ResourceKind::AccessPolicy,
        ResourceKind::Collection,
        ResourceKind::KnowledgeBase,
        ResourceKind::DataSource,
        ResourceKind::Vpc,
        ResourceKind::Subnet,
        ResourceKind::InternetGateway,
        ResourceKind::NatGateway,
        ResourceKind::RouteTable,
        ResourceKind::SecurityGroup,
        ResourceKind::VpcEndpoint,
        ResourceKind::LoadBalancer,
        ResourceKind::TargetGroup,
        ResourceKind::Listener,
        ResourceKind::Instance,
        ResourceKind::Distribution,
    ] {
        assert!(
            env.provider.resources_of(kind).is_empty(),
            "{} left behind",
            kind
        );
    }
}

#[tokio::test]
async fn test_teardown_order() {
    let env = TestEnv::new();
    env.provision().await.unwrap();
    env.teardown().await;

    let provider = &env.provider;
    let steps = [
        provider.position(CallOp::Release, ResourceKind::Distribution),
        provider.position(CallOp::Delete, ResourceKind::LoadBalancer),
        provider.position(CallOp::Delete, ResourceKind::Instance),
        provider.position(CallOp::Delete, ResourceKind::NatGateway),
        provider.position(CallOp::Delete, ResourceKind::VpcEndpoint),
        provider.position(CallOp::DetachReferences, ResourceKind::SecurityGroup),
        provider.position(CallOp::Delete, ResourceKind::SecurityGroup),
        provider.position(CallOp::Delete, ResourceKind::RouteTable),
        provider.position(CallOp::Delete, ResourceKind::Vpc),
        provider.position(CallOp::Delete, ResourceKind::Collection),
        provider.position(CallOp::Delete, ResourceKind::KnowledgeBase),
        provider.position(CallOp::Delete, ResourceKind::Secret),
        provider.position(CallOp::Delete, ResourceKind::Role),
        provider.position(CallOp::Delete, ResourceKind::Bucket),
        provider.position(CallOp::Delete, ResourceKind::Distribution),
    ];
    let steps: Vec<usize> = steps.into_iter().map(Option::unwrap).collect();
    assert!(steps.windows(2).all(|w| w[0] < w[1]), "{:?}", steps);
}

#[tokio::test]
async fn test_blocked_vpc_does_not_stop_teardown() {
    let env = TestEnv::new();
    env.provision().await.unwrap();
    env.provider.block_delete(env.run_config().vpc_name());

    let report = env.teardown().await;

    assert!(!report.is_success());
    let failed = report.failed_of(ResourceKind::Vpc);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap().contains("dependent objects"));

    // Three attempts in the main pass and three in the final pass
    assert_eq!(env.provider.count(CallOp::Delete, ResourceKind::Vpc), 6);

    // Everything after the network still went
    assert!(env.provider.resources_of(ResourceKind::Collection).is_empty());
    assert!(env.provider.resources_of(ResourceKind::Bucket).is_empty());
    assert!(env.provider.resources_of(ResourceKind::Role).is_empty());
}

#[tokio::test]
async fn test_second_teardown_is_a_no_op() {
    let env = TestEnv::new();
    env.provision().await.unwrap();
    env.teardown().await;

    let report = env.teardown().await;
    assert!(report.is_success());
    assert_eq!(report.deleted_count(), 0);
}

#[tokio::test]
async fn test_throttled_listing_is_retried() {
    let env = TestEnv::new();
    env.provision().await.unwrap();
    env.provider.throttle_next_discovers(ResourceKind::Vpc, 2);

    let report = env.teardown().await;

    assert!(report.is_success(), "{:?}", report.failed);
    assert!(env.provider.resources_of(ResourceKind::Vpc).is_empty());
    assert_eq!(env.provider.count(CallOp::Discover, ResourceKind::Vpc), 3);
}

#[tokio::test]
async fn test_failed_listing_fails_the_teardown() {
    let env = TestEnv::new();
    env.provision().await.unwrap();
    env.provider.throttle_next_discovers(ResourceKind::Vpc, u32::MAX);

    let report = env.teardown().await;

    assert!(!report.is_success());
    let failed = report.failed_of(ResourceKind::Vpc);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, DISCOVERY);
    assert!(failed[0].error.as_deref().unwrap().contains("throttled"));
    assert!(report.to_string().contains("1 failed"));

    // The VPC was never seen, so it is still there
    assert_eq!(env.provider.resources_of(ResourceKind::Vpc).len(), 1);
    assert_eq!(env.provider.count(CallOp::Delete, ResourceKind::Vpc), 0);

    // The rest of the run went on
    assert!(env.provider.resources_of(ResourceKind::Bucket).is_empty());
}
