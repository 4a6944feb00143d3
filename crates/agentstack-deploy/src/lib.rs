//! agentstack Deployment
//!
//! Provisioning and teardown of the agent application's cloud environment.
//!
//! # Stages
//!
//! 1. storage bucket
//! 2. identity roles and instance profile
//! 3. API key secrets
//! 4. search collection, its policies and vector index
//! 5. knowledge base and data source
//! 6. virtual network
//! 7. load balancer
//! 8. CDN distribution
//! 9. compute instance
//! 10. target group, listener and header rule
//! 11. HTTP readiness
//!
//! [`Teardown`] removes the same resources in reverse dependency order, and
//! [`RemoteSetup`] re-runs the instance setup script or audits placement.

pub mod error;
pub mod naming;
pub mod network;
pub mod policies;
pub mod prompt;
pub mod provision;
pub mod readiness;
pub mod remote;
pub mod teardown;
pub mod user_data;

// Re-exports
pub use error::{DeployError, Result};
pub use naming::{CUSTOM_HEADER_NAME, RunConfig, TOTAL_STAGES};
pub use network::{
    PlannedSubnet, SubnetClassification, classify_subnets, pick_cidr, plan_subnets, subnet_cidr,
    validate_load_balancer_subnets,
};
pub use prompt::{DialoguerPrompt, EmptyPrompt, SecretPrompt};
pub use provision::{
    ComputeInstance, Distribution, Identities, KnowledgeBase, LoadBalancer, NetworkLayout,
    ProvisionOutcome, Provisioner, Routing, SearchCollection, SecretArns, StageTimings,
    StorageOutput,
};
pub use readiness::{HttpProbe, Readiness, ReqwestProbe, StaticProbe, check_application_ready};
pub use remote::{PlacementAudit, RemoteSetup, RemoteTimings, SetupOutcome, SubnetPlacement};
pub use teardown::{DISCOVERY, Teardown, TeardownTimings};
pub use user_data::{encode_user_data, render_setup_script};
