//! Resource descriptors
//!
//! A [`ResourceDescriptor`] is what every probe, create and discover call
//! hands back: the kind, the derived name used as the idempotency key, the
//! provider-assigned identifiers and whatever attributes later stages need.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Attribute keys shared by every provider implementation
pub mod attr {
    /// Search collection endpoint URL
    pub const ENDPOINT: &str = "endpoint";
    /// Collection a knowledge base is bound to
    pub const COLLECTION_ARN: &str = "collection_arn";
    /// Knowledge base a data source belongs to
    pub const KNOWLEDGE_BASE_ID: &str = "knowledge_base_id";
    pub const CIDR: &str = "cidr";
    pub const VPC_ID: &str = "vpc_id";
    pub const SUBNET_ID: &str = "subnet_id";
    pub const AVAILABILITY_ZONE: &str = "availability_zone";
    /// Load balancer DNS name
    pub const DNS_NAME: &str = "dns_name";
    /// Distribution domain name
    pub const DOMAIN_NAME: &str = "domain_name";
    pub const ENABLED: &str = "enabled";
    /// Raw provider state (instances, NAT gateways)
    pub const STATE: &str = "state";
    pub const PRIVATE_IP: &str = "private_ip";
    pub const PUBLIC_IP: &str = "public_ip";
    /// Security group ingress rules
    pub const INGRESS: &str = "ingress";
    /// Principals of a data access policy
    pub const PRINCIPALS: &str = "principals";
    pub const IS_DEFAULT: &str = "is_default";
}

/// Every provider object the orchestrators touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Bucket,
    Role,
    InstanceProfile,
    Secret,
    SecurityPolicy,
    AccessPolicy,
    Collection,
    VectorIndex,
    KnowledgeBase,
    DataSource,
    Vpc,
    Subnet,
    InternetGateway,
    NatGateway,
    RouteTable,
    SecurityGroup,
    VpcEndpoint,
    LoadBalancer,
    TargetGroup,
    Listener,
    ListenerRule,
    OriginAccessIdentity,
    Distribution,
    Instance,
}

/// Coarse resource categories used in progress output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceCategory {
    Storage,
    Role,
    Secret,
    SearchCollection,
    KnowledgeBase,
    Network,
    LoadBalancer,
    Cdn,
    Compute,
}

impl ResourceKind {
    pub fn category(&self) -> ResourceCategory {
        use ResourceKind::*;
        match self {
            Bucket => ResourceCategory::Storage,
            Role | InstanceProfile => ResourceCategory::Role,
            Secret => ResourceCategory::Secret,
            SecurityPolicy | AccessPolicy | Collection | VectorIndex => {
                ResourceCategory::SearchCollection
            }
            KnowledgeBase | DataSource => ResourceCategory::KnowledgeBase,
            Vpc | Subnet | InternetGateway | NatGateway | RouteTable | SecurityGroup
            | VpcEndpoint => ResourceCategory::Network,
            LoadBalancer | TargetGroup | Listener | ListenerRule => ResourceCategory::LoadBalancer,
            OriginAccessIdentity | Distribution => ResourceCategory::Cdn,
            Instance => ResourceCategory::Compute,
        }
    }

    /// Short identifier prefix, matching the shape of provider ids
    pub fn id_prefix(&self) -> &'static str {
        use ResourceKind::*;
        match self {
            Bucket => "bucket",
            Role => "role",
            InstanceProfile => "profile",
            Secret => "secret",
            SecurityPolicy => "secpol",
            AccessPolicy => "accpol",
            Collection => "coll",
            VectorIndex => "index",
            KnowledgeBase => "kb",
            DataSource => "ds",
            Vpc => "vpc",
            Subnet => "subnet",
            InternetGateway => "igw",
            NatGateway => "nat",
            RouteTable => "rtb",
            SecurityGroup => "sg",
            VpcEndpoint => "vpce",
            LoadBalancer => "alb",
            TargetGroup => "tg",
            Listener => "listener",
            ListenerRule => "rule",
            OriginAccessIdentity => "oai",
            Distribution => "dist",
            Instance => "i",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&text)
    }
}

impl std::fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceCategory::Storage => write!(f, "storage"),
            ResourceCategory::Role => write!(f, "role"),
            ResourceCategory::Secret => write!(f, "secret"),
            ResourceCategory::SearchCollection => write!(f, "search-collection"),
            ResourceCategory::KnowledgeBase => write!(f, "knowledge-base"),
            ResourceCategory::Network => write!(f, "network"),
            ResourceCategory::LoadBalancer => write!(f, "load-balancer"),
            ResourceCategory::Cdn => write!(f, "cdn"),
            ResourceCategory::Compute => write!(f, "compute"),
        }
    }
}

/// A provider resource as seen by the orchestrators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource kind
    pub kind: ResourceKind,

    /// Derived name (the idempotency key)
    pub name: String,

    /// Provider-assigned identifier, `None` until created
    pub id: Option<String>,

    /// Provider ARN when the kind has one
    pub arn: Option<String>,

    /// Current status
    pub status: ResourceStatus,

    /// Tags (Name, project markers)
    pub tags: BTreeMap<String, String>,

    /// Kind-specific attributes (DNS names, endpoints, subnet ids, ...)
    pub attributes: HashMap<String, serde_json::Value>,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: None,
            arn: None,
            status: ResourceStatus::Unknown,
            tags: BTreeMap::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        self.arn = Some(arn.into());
        self
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// String attribute shortcut
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// The identifier later stages consume: the ARN when present, otherwise the id
    pub fn identifier(&self) -> Option<&str> {
        self.arn.as_deref().or(self.id.as_deref())
    }

    /// Provider id, falling back to the derived name for name-addressed kinds
    pub fn id_or_name(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    /// Short label for logs and reports
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) if id != &self.name => format!("{} {} ({})", self.kind, self.name, id),
            _ => format!("{} {}", self.kind, self.name),
        }
    }
}

/// Status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Being created or propagating
    Pending,
    /// Usable (network objects, instances)
    Available,
    /// Active (search collections, knowledge bases)
    Active,
    /// Disabled (distributions)
    Disabled,
    /// Being deleted
    Deleting,
    /// Gone
    Deleted,
    /// Terminal failure
    Failed,
    /// Status is unknown
    Unknown,
}

impl ResourceStatus {
    /// Map a provider status string onto the common status set
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "creating" | "pending" | "provisioning" | "inprogress" | "in_progress"
            | "updating" => ResourceStatus::Pending,
            "available" | "running" | "deployed" | "attached" | "success" => {
                ResourceStatus::Available
            }
            "active" | "enabled" => ResourceStatus::Active,
            "disabled" | "stopped" | "stopping" => ResourceStatus::Disabled,
            "deleting" | "shutting-down" => ResourceStatus::Deleting,
            "deleted" | "terminated" => ResourceStatus::Deleted,
            "failed" | "create_failed" | "delete_unsuccessful" | "error" => {
                ResourceStatus::Failed
            }
            _ => ResourceStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Pending => write!(f, "pending"),
            ResourceStatus::Available => write!(f, "available"),
            ResourceStatus::Active => write!(f, "active"),
            ResourceStatus::Disabled => write!(f, "disabled"),
            ResourceStatus::Deleting => write!(f, "deleting"),
            ResourceStatus::Deleted => write!(f, "deleted"),
            ResourceStatus::Failed => write!(f, "failed"),
            ResourceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(ResourceStatus::parse("ACTIVE"), ResourceStatus::Active);
        assert_eq!(ResourceStatus::parse("available"), ResourceStatus::Available);
        assert_eq!(ResourceStatus::parse("InProgress"), ResourceStatus::Pending);
        assert_eq!(ResourceStatus::parse("Deployed"), ResourceStatus::Available);
        assert_eq!(ResourceStatus::parse("FAILED"), ResourceStatus::Failed);
        assert_eq!(ResourceStatus::parse("whatever"), ResourceStatus::Unknown);
    }

    #[test]
    fn test_identifier_prefers_arn() {
        let role = ResourceDescriptor::new(ResourceKind::Role, "role-ec2")
            .with_id("AROA123")
            .with_arn("arn:aws:iam::123456789012:role/role-ec2");
        assert_eq!(
            role.identifier(),
            Some("arn:aws:iam::123456789012:role/role-ec2")
        );

        let vpc = ResourceDescriptor::new(ResourceKind::Vpc, "vpc-for-demo").with_id("vpc-0abc");
        assert_eq!(vpc.identifier(), Some("vpc-0abc"));
    }

    #[test]
    fn test_kind_display_and_category() {
        assert_eq!(ResourceKind::NatGateway.to_string(), "nat-gateway");
        assert_eq!(
            ResourceKind::ListenerRule.category(),
            ResourceCategory::LoadBalancer
        );
        assert_eq!(ResourceKind::VectorIndex.category().to_string(), "search-collection");
    }

    #[test]
    fn test_typed_attributes() {
        let alb = ResourceDescriptor::new(ResourceKind::LoadBalancer, "alb-for-demo")
            .with_attribute("dns_name", serde_json::json!("alb-1.elb.amazonaws.com"))
            .with_attribute("zones", serde_json::json!(["us-west-2a", "us-west-2b"]));
        assert_eq!(alb.attr_str("dns_name"), Some("alb-1.elb.amazonaws.com"));
        let zones: Vec<String> = alb.attribute("zones").unwrap();
        assert_eq!(zones.len(), 2);
    }
}
