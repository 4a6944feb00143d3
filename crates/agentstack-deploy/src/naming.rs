//! Run configuration and derived resource names
//!
//! Every name the orchestrators create, probe or discover comes from here.
//! Names double as idempotency keys, so they must stay stable between runs.

use serde::{Deserialize, Serialize};

/// Number of provisioning stages, used in `[n/11]` progress lines
pub const TOTAL_STAGES: u8 = 11;

/// Header the distribution adds and the listener rule matches
pub const CUSTOM_HEADER_NAME: &str = "X-Custom-Header";

const CUSTOM_HEADER_SUFFIX: &str = "12dab15e4s31";

/// Prefixes under the bucket that the distribution and data source use
pub const STATIC_PATHS: [&str; 2] = ["/images/*", "/docs/*"];
pub const DOCS_PREFIX: &str = "docs/";

pub const EMBEDDING_DIMENSIONS: u32 = 1024;
const EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v2:0";
const PARSING_PROFILE: &str = "global.anthropic.claude-haiku-4-5-20251001-v1:0";

/// Inputs of one provisioning or teardown run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub project_name: String,
    pub region: String,
    pub account_id: String,
    pub git_name: String,
    pub repository_owner: String,
    pub instance_type: String,
    pub volume_size_gb: u32,
    pub app_port: u16,
}

impl RunConfig {
    pub fn new(
        project_name: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        let project_name = project_name.into();
        Self {
            git_name: project_name.clone(),
            project_name,
            region: region.into(),
            account_id: account_id.into(),
            repository_owner: "kyopark2014".to_string(),
            instance_type: "t3.medium".to_string(),
            volume_size_gb: 80,
            app_port: 8501,
        }
    }

    fn p(&self) -> &str {
        &self.project_name
    }

    // ---- storage ----

    pub fn bucket_name(&self) -> String {
        format!("storage-for-{}-{}-{}", self.p(), self.account_id, self.region)
    }

    /// Bucket name produced by runs that had no account id; teardown only
    pub fn legacy_bucket_name(&self) -> String {
        format!("storage-for-{}--{}", self.p(), self.region)
    }

    pub fn bucket_arn(&self) -> String {
        format!("arn:aws:s3:::{}", self.bucket_name())
    }

    /// Regional domain of the bucket, the distribution's static origin
    pub fn bucket_domain(&self) -> String {
        format!("{}.s3.{}.amazonaws.com", self.bucket_name(), self.region)
    }

    // ---- routing header ----

    pub fn header_value(&self) -> String {
        format!("{}_{}", self.p(), CUSTOM_HEADER_SUFFIX)
    }

    // ---- identity ----

    pub fn knowledge_base_role_name(&self) -> String {
        format!("role-knowledge-base-for-{}-{}", self.p(), self.region)
    }

    pub fn agent_role_name(&self) -> String {
        format!("role-agent-for-{}-{}", self.p(), self.region)
    }

    pub fn compute_role_name(&self) -> String {
        format!("role-ec2-for-{}-{}", self.p(), self.region)
    }

    pub fn instance_profile_name(&self) -> String {
        format!("instance-profile-{}-{}", self.p(), self.region)
    }

    pub fn account_root_arn(&self) -> String {
        format!("arn:aws:iam::{}:root", self.account_id)
    }

    // ---- secrets ----

    pub fn weather_secret_name(&self) -> String {
        format!("openweathermap-{}", self.p())
    }

    pub fn tavily_secret_name(&self) -> String {
        format!("tavilyapikey-{}", self.p())
    }

    // ---- search ----

    pub fn collection_name(&self) -> String {
        self.project_name.clone()
    }

    pub fn encryption_policy_name(&self) -> String {
        format!("enc-{}-{}", self.p(), self.region)
    }

    pub fn network_policy_name(&self) -> String {
        format!("net-{}-{}", self.p(), self.region)
    }

    pub fn data_policy_name(&self) -> String {
        format!("data-{}", self.p())
    }

    pub fn vector_index_name(&self) -> String {
        self.project_name.clone()
    }

    // ---- knowledge base ----

    pub fn knowledge_base_name(&self) -> String {
        self.project_name.clone()
    }

    pub fn data_source_name(&self) -> String {
        self.bucket_name()
    }

    pub fn embedding_model_arn(&self) -> String {
        format!("arn:aws:bedrock:{}::foundation-model/{}", self.region, EMBEDDING_MODEL)
    }

    pub fn parsing_model_arn(&self) -> String {
        format!(
            "arn:aws:bedrock:{}:{}:inference-profile/{}",
            self.region, self.account_id, PARSING_PROFILE
        )
    }

    // ---- network ----

    pub fn vpc_name(&self) -> String {
        format!("vpc-for-{}", self.p())
    }

    pub fn internet_gateway_name(&self) -> String {
        format!("igw-{}", self.p())
    }

    pub fn nat_gateway_name(&self) -> String {
        format!("nat-{}", self.p())
    }

    /// `n` is 1-based
    pub fn public_subnet_name(&self, n: usize) -> String {
        format!("public-subnet-for-{}-{}", self.p(), n)
    }

    /// `n` is 1-based
    pub fn private_subnet_name(&self, n: usize) -> String {
        format!("private-subnet-for-{}-{}", self.p(), n)
    }

    pub fn public_route_table_name(&self) -> String {
        format!("public-rt-{}", self.p())
    }

    pub fn private_route_table_name(&self) -> String {
        format!("private-rt-{}", self.p())
    }

    pub fn alb_security_group_name(&self) -> String {
        format!("alb-sg-for-{}", self.p())
    }

    pub fn compute_security_group_name(&self) -> String {
        format!("ec2-sg-for-{}", self.p())
    }

    pub fn endpoint_name(&self) -> String {
        format!("bedrock-endpoint-{}", self.p())
    }

    pub fn endpoint_service_name(&self) -> String {
        format!("com.amazonaws.{}.bedrock-runtime", self.region)
    }

    // ---- load balancing ----

    pub fn load_balancer_name(&self) -> String {
        format!("alb-for-{}", self.p())
    }

    pub fn target_group_name(&self) -> String {
        format!("TG-for-{}", self.p())
    }

    /// Listeners are addressed as `<load balancer>:<port>`
    pub fn listener_name(&self) -> String {
        format!("{}:80", self.load_balancer_name())
    }

    /// Rules are addressed as `<listener>:<priority>`
    pub fn listener_rule_name(&self) -> String {
        format!("{}:10", self.listener_name())
    }

    // ---- cdn ----

    pub fn distribution_name(&self) -> String {
        format!("CloudFront-for-{}-Hybrid", self.p())
    }

    pub fn origin_access_identity_name(&self) -> String {
        format!("OAI for {} S3 bucket", self.p())
    }

    // ---- compute ----

    pub fn instance_name(&self) -> String {
        format!("app-for-{}", self.p())
    }

    pub fn repository_url(&self) -> String {
        format!("https://github.com/{}/{}", self.repository_owner, self.git_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunConfig {
        RunConfig::new("woo-project", "us-west-2", "123456789012")
    }

    #[test]
    fn test_storage_names() {
        let run = run();
        assert_eq!(run.bucket_name(), "storage-for-woo-project-123456789012-us-west-2");
        assert_eq!(run.legacy_bucket_name(), "storage-for-woo-project--us-west-2");
        assert_eq!(
            run.bucket_domain(),
            "storage-for-woo-project-123456789012-us-west-2.s3.us-west-2.amazonaws.com"
        );
        assert_eq!(run.data_source_name(), run.bucket_name());
    }

    #[test]
    fn test_identity_and_search_names() {
        let run = run();
        assert_eq!(run.knowledge_base_role_name(), "role-knowledge-base-for-woo-project-us-west-2");
        assert_eq!(run.compute_role_name(), "role-ec2-for-woo-project-us-west-2");
        assert_eq!(run.instance_profile_name(), "instance-profile-woo-project-us-west-2");
        assert_eq!(run.encryption_policy_name(), "enc-woo-project-us-west-2");
        assert_eq!(run.network_policy_name(), "net-woo-project-us-west-2");
        assert_eq!(run.data_policy_name(), "data-woo-project");
        assert_eq!(run.collection_name(), "woo-project");
    }

    #[test]
    fn test_routing_names() {
        let run = run();
        assert_eq!(run.header_value(), "woo-project_12dab15e4s31");
        assert_eq!(run.listener_name(), "alb-for-woo-project:80");
        assert_eq!(run.listener_rule_name(), "alb-for-woo-project:80:10");
        assert_eq!(run.distribution_name(), "CloudFront-for-woo-project-Hybrid");
        assert_eq!(run.origin_access_identity_name(), "OAI for woo-project S3 bucket");
    }

    #[test]
    fn test_model_arns() {
        let run = run();
        assert_eq!(
            run.embedding_model_arn(),
            "arn:aws:bedrock:us-west-2::foundation-model/amazon.titan-embed-text-v2:0"
        );
        assert!(run
            .parsing_model_arn()
            .starts_with("arn:aws:bedrock:us-west-2:123456789012:inference-profile/global."));
    }

    #[test]
    fn test_git_name_defaults_to_project() {
        let mut run = run();
        assert_eq!(run.repository_url(), "https://github.com/kyopark2014/woo-project");
        run.git_name = "other".into();
        assert_eq!(run.repository_url(), "https://github.com/kyopark2014/other");
    }
}
