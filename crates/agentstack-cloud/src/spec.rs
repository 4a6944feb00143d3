//! Closed resource specs
//!
//! [`ResourceSpec`] describes something to create, [`Setting`] something to
//! apply on top of an existing resource. Both are closed sets: a provider
//! matches on the variant instead of probing loosely typed maps.

use crate::resource::ResourceKind;
use serde::{Deserialize, Serialize};

/// A named inline policy document attached to a role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlinePolicy {
    pub name: String,
    pub document: serde_json::Value,
}

impl InlinePolicy {
    pub fn new(name: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            document,
        }
    }
}

/// Search collection security policy type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Encryption,
    Network,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Encryption => "encryption",
            PolicyType::Network => "network",
        }
    }
}

/// Security group ingress rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: String,
    pub port: u16,
    /// CIDR source, e.g. `0.0.0.0/0`
    pub cidr: Option<String>,
    /// Source security group id
    pub source_group: Option<String>,
    pub description: String,
}

impl IngressRule {
    pub fn tcp_from_cidr(
        port: u16,
        cidr: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            protocol: "tcp".to_string(),
            port,
            cidr: Some(cidr.into()),
            source_group: None,
            description: description.into(),
        }
    }

    pub fn tcp_from_group(
        port: u16,
        group_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            protocol: "tcp".to_string(),
            port,
            cidr: None,
            source_group: Some(group_id.into()),
            description: description.into(),
        }
    }
}

/// Target of a route entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RouteTarget {
    InternetGateway(String),
    NatGateway(String),
}

impl RouteTarget {
    pub fn id(&self) -> &str {
        match self {
            RouteTarget::InternetGateway(id) | RouteTarget::NatGateway(id) => id,
        }
    }
}

/// What to create, one variant per creatable kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceSpec {
    Bucket {
        name: String,
    },
    Role {
        name: String,
        trust_policy: serde_json::Value,
        description: String,
    },
    InstanceProfile {
        name: String,
    },
    Secret {
        name: String,
        description: String,
        /// JSON payload, serialized only here
        payload: String,
    },
    SecurityPolicy {
        name: String,
        policy_type: PolicyType,
        document: serde_json::Value,
        description: String,
    },
    AccessPolicy {
        name: String,
        document: serde_json::Value,
        description: String,
    },
    Collection {
        name: String,
        description: String,
    },
    VectorIndex {
        name: String,
        endpoint: String,
        body: serde_json::Value,
    },
    KnowledgeBase {
        name: String,
        description: String,
        role_arn: String,
        collection_arn: String,
        index_name: String,
        embedding_model_arn: String,
        dimensions: u32,
    },
    DataSource {
        name: String,
        knowledge_base_id: String,
        bucket_arn: String,
        inclusion_prefixes: Vec<String>,
        parsing_model_arn: String,
    },
    Vpc {
        name: String,
        cidr: String,
    },
    Subnet {
        name: String,
        vpc_id: String,
        cidr: String,
        availability_zone: String,
        public: bool,
    },
    InternetGateway {
        name: String,
        vpc_id: String,
    },
    NatGateway {
        name: String,
        subnet_id: String,
    },
    RouteTable {
        name: String,
        vpc_id: String,
    },
    SecurityGroup {
        name: String,
        vpc_id: String,
        description: String,
        ingress: Vec<IngressRule>,
    },
    VpcEndpoint {
        name: String,
        vpc_id: String,
        service_name: String,
        subnet_ids: Vec<String>,
        security_group_ids: Vec<String>,
    },
    LoadBalancer {
        name: String,
        subnet_ids: Vec<String>,
        security_group_ids: Vec<String>,
    },
    TargetGroup {
        name: String,
        vpc_id: String,
        port: u16,
        health_check_path: String,
    },
    Listener {
        name: String,
        load_balancer_arn: String,
        target_group_arn: String,
        port: u16,
    },
    ListenerRule {
        name: String,
        listener_arn: String,
        target_group_arn: String,
        priority: u32,
        header_name: String,
        header_value: String,
    },
    OriginAccessIdentity {
        /// The OAI comment doubles as its name
        name: String,
    },
    Distribution {
        /// The distribution comment doubles as its name
        name: String,
        project_name: String,
        alb_dns: String,
        bucket_domain: String,
        oai_id: String,
        static_paths: Vec<String>,
    },
    Instance {
        name: String,
        image_id: String,
        instance_type: String,
        subnet_id: String,
        security_group_ids: Vec<String>,
        instance_profile: String,
        volume_size_gb: u32,
        /// Base64 encoded startup script
        user_data: String,
    },
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Bucket { .. } => ResourceKind::Bucket,
            ResourceSpec::Role { .. } => ResourceKind::Role,
            ResourceSpec::InstanceProfile { .. } => ResourceKind::InstanceProfile,
            ResourceSpec::Secret { .. } => ResourceKind::Secret,
            ResourceSpec::SecurityPolicy { .. } => ResourceKind::SecurityPolicy,
            ResourceSpec::AccessPolicy { .. } => ResourceKind::AccessPolicy,
            ResourceSpec::Collection { .. } => ResourceKind::Collection,
            ResourceSpec::VectorIndex { .. } => ResourceKind::VectorIndex,
            ResourceSpec::KnowledgeBase { .. } => ResourceKind::KnowledgeBase,
            ResourceSpec::DataSource { .. } => ResourceKind::DataSource,
            ResourceSpec::Vpc { .. } => ResourceKind::Vpc,
            ResourceSpec::Subnet { .. } => ResourceKind::Subnet,
            ResourceSpec::InternetGateway { .. } => ResourceKind::InternetGateway,
            ResourceSpec::NatGateway { .. } => ResourceKind::NatGateway,
            ResourceSpec::RouteTable { .. } => ResourceKind::RouteTable,
            ResourceSpec::SecurityGroup { .. } => ResourceKind::SecurityGroup,
            ResourceSpec::VpcEndpoint { .. } => ResourceKind::VpcEndpoint,
            ResourceSpec::LoadBalancer { .. } => ResourceKind::LoadBalancer,
            ResourceSpec::TargetGroup { .. } => ResourceKind::TargetGroup,
            ResourceSpec::Listener { .. } => ResourceKind::Listener,
            ResourceSpec::ListenerRule { .. } => ResourceKind::ListenerRule,
            ResourceSpec::OriginAccessIdentity { .. } => ResourceKind::OriginAccessIdentity,
            ResourceSpec::Distribution { .. } => ResourceKind::Distribution,
            ResourceSpec::Instance { .. } => ResourceKind::Instance,
        }
    }

    /// Derived name used for the existence probe
    pub fn name(&self) -> &str {
        match self {
            ResourceSpec::Bucket { name }
            | ResourceSpec::Role { name, .. }
            | ResourceSpec::InstanceProfile { name }
            | ResourceSpec::Secret { name, .. }
            | ResourceSpec::SecurityPolicy { name, .. }
            | ResourceSpec::AccessPolicy { name, .. }
            | ResourceSpec::Collection { name, .. }
            | ResourceSpec::VectorIndex { name, .. }
            | ResourceSpec::KnowledgeBase { name, .. }
            | ResourceSpec::DataSource { name, .. }
            | ResourceSpec::Vpc { name, .. }
            | ResourceSpec::Subnet { name, .. }
            | ResourceSpec::InternetGateway { name, .. }
            | ResourceSpec::NatGateway { name, .. }
            | ResourceSpec::RouteTable { name, .. }
            | ResourceSpec::SecurityGroup { name, .. }
            | ResourceSpec::VpcEndpoint { name, .. }
            | ResourceSpec::LoadBalancer { name, .. }
            | ResourceSpec::TargetGroup { name, .. }
            | ResourceSpec::Listener { name, .. }
            | ResourceSpec::ListenerRule { name, .. }
            | ResourceSpec::OriginAccessIdentity { name }
            | ResourceSpec::Distribution { name, .. }
            | ResourceSpec::Instance { name, .. } => name,
        }
    }
}

/// Overwrite-style operations on existing resources
///
/// Applying the same setting twice leaves the resource unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "setting", rename_all = "kebab-case")]
pub enum Setting {
    /// Public access block, CORS, suspended versioning and the `docs/` prefix
    BucketDefaults { bucket: String },
    BucketPolicy {
        bucket: String,
        policy: serde_json::Value,
    },
    RoleInlinePolicy { role: String, policy: InlinePolicy },
    /// Attach if missing
    RoleManagedPolicy { role: String, policy_arn: String },
    InstanceProfileRole { profile: String, role: String },
    /// Add any principal missing from an existing data access policy
    AccessPolicyPrincipals {
        policy: String,
        principals: Vec<String>,
    },
    VpcDnsSupport { vpc_id: String },
    SubnetPublicIp { subnet_id: String },
    /// RouteAlreadyExists counts as applied
    Route {
        route_table_id: String,
        destination: String,
        target: RouteTarget,
    },
    RouteTableAssociation {
        route_table_id: String,
        subnet_id: String,
    },
    /// DuplicateTarget counts as applied
    TargetRegistration {
        target_group_arn: String,
        instance_id: String,
        port: u16,
    },
    EnableDistribution { distribution_id: String },
}

impl Setting {
    /// Short label for logs
    pub fn describe(&self) -> String {
        match self {
            Setting::BucketDefaults { bucket } => format!("bucket defaults on {}", bucket),
            Setting::BucketPolicy { bucket, .. } => format!("bucket policy on {}", bucket),
            Setting::RoleInlinePolicy { role, policy } => {
                format!("inline policy {} on {}", policy.name, role)
            }
            Setting::RoleManagedPolicy { role, policy_arn } => {
                format!("managed policy {} on {}", policy_arn, role)
            }
            Setting::InstanceProfileRole { profile, role } => {
                format!("role {} in instance profile {}", role, profile)
            }
            Setting::AccessPolicyPrincipals { policy, principals } => {
                format!("{} principals on {}", principals.len(), policy)
            }
            Setting::VpcDnsSupport { vpc_id } => format!("DNS attributes on {}", vpc_id),
            Setting::SubnetPublicIp { subnet_id } => format!("public IP mapping on {}", subnet_id),
            Setting::Route {
                route_table_id,
                destination,
                target,
            } => format!("route {} -> {} in {}", destination, target.id(), route_table_id),
            Setting::RouteTableAssociation {
                route_table_id,
                subnet_id,
            } => format!("association {} -> {}", subnet_id, route_table_id),
            Setting::TargetRegistration {
                target_group_arn,
                instance_id,
                ..
            } => format!("target {} in {}", instance_id, target_group_arn),
            Setting::EnableDistribution { distribution_id } => {
                format!("enable distribution {}", distribution_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_kind_and_name() {
        let spec = ResourceSpec::Subnet {
            name: "public-subnet-for-demo-1".into(),
            vpc_id: "vpc-0001".into(),
            cidr: "10.20.0.0/24".into(),
            availability_zone: "us-west-2a".into(),
            public: true,
        };
        assert_eq!(spec.kind(), ResourceKind::Subnet);
        assert_eq!(spec.name(), "public-subnet-for-demo-1");
    }

    #[test]
    fn test_spec_serializes_with_kind_tag() {
        let spec = ResourceSpec::Vpc {
            name: "vpc-for-demo".into(),
            cidr: "10.20.0.0/16".into(),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["kind"], "vpc");
        assert_eq!(value["cidr"], "10.20.0.0/16");
    }

    #[test]
    fn test_setting_describe() {
        let setting = Setting::Route {
            route_table_id: "rtb-1".into(),
            destination: "0.0.0.0/0".into(),
            target: RouteTarget::InternetGateway("igw-1".into()),
        };
        assert_eq!(setting.describe(), "route 0.0.0.0/0 -> igw-1 in rtb-1");
    }
}
