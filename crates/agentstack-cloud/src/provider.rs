//! Cloud provider trait definition

use crate::error::Result;
use crate::resource::{ResourceDescriptor, ResourceKind};
use crate::spec::{ResourceSpec, Setting};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Cloud provider abstraction trait
///
/// The provisioner and the teardown orchestrator only talk to the cloud
/// through this trait. The AWS implementation shells out to the `aws` CLI;
/// the in-memory implementation backs tests and `--dry-run`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name (e.g., "aws", "memory")
    fn name(&self) -> &str;

    /// Check that credentials are usable and resolve the account id
    async fn check_auth(&self) -> Result<AuthStatus>;

    /// Existence probe by derived name (or tag / comment for unnamed kinds)
    async fn find(&self, kind: ResourceKind, name: &str) -> Result<Option<ResourceDescriptor>>;

    /// Issue the provider's create call
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceDescriptor>;

    /// Apply an overwrite-style setting
    async fn apply(&self, setting: &Setting) -> Result<()>;

    /// Raw status string of a resource, for the readiness poller
    async fn status(&self, kind: ResourceKind, id: &str) -> Result<String>;

    /// CIDR blocks of every existing virtual network
    async fn existing_cidrs(&self) -> Result<Vec<String>>;

    /// Availability zones of the configured region
    async fn availability_zones(&self) -> Result<Vec<String>>;

    /// Subnets and route tables of one virtual network
    async fn network_snapshot(&self, vpc_id: &str) -> Result<NetworkSnapshot>;

    /// Newest machine image matching the first pattern that has any match
    async fn latest_image(&self, name_patterns: &[&str]) -> Result<Option<String>>;

    /// Every resource of `kind` whose name, tag, or comment contains `pattern`
    async fn discover(&self, kind: ResourceKind, pattern: &str) -> Result<Vec<ResourceDescriptor>>;

    /// Strip dependants that would block deleting `target`
    async fn release(&self, target: &ResourceDescriptor) -> Result<()>;

    /// Remove security group rules, system wide, that reference any of `groups`
    ///
    /// Returns the number of rules removed.
    async fn detach_references(&self, groups: &[ResourceDescriptor]) -> Result<usize>;

    /// Issue the provider's delete call
    async fn delete(&self, target: &ResourceDescriptor) -> Result<()>;
}

/// Remote command channel into compute instances
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Whether the instance's remote agent is registered
    async fn is_managed(&self, instance_id: &str) -> Result<bool>;

    /// Send a shell script; returns the command id
    async fn send_script(&self, instance_id: &str, script: &str, comment: &str) -> Result<String>;

    /// Current state of a sent command
    async fn invocation(&self, command_id: &str, instance_id: &str) -> Result<Invocation>;
}

/// Result of a remote command invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// `Pending`, `InProgress`, `Success`, `Failed`, `Cancelled`, `TimedOut`, ...
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl Invocation {
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status.as_str(),
            "Success" | "Failed" | "Cancelled" | "TimedOut"
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account id if available
    pub account_id: Option<String>,

    /// Caller ARN if available
    pub caller: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_id: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_id: Some(account_id.into()),
            caller: Some(caller.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_id: None,
            caller: None,
            error: Some(error.into()),
        }
    }
}

/// Subnets and route tables of one virtual network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub subnets: Vec<SubnetInfo>,
    pub route_tables: Vec<RouteTableInfo>,
}

impl NetworkSnapshot {
    /// Route table explicitly associated with the subnet, else the main table
    pub fn route_table_for(&self, subnet_id: &str) -> Option<&RouteTableInfo> {
        self.route_tables
            .iter()
            .find(|rt| rt.subnet_ids.iter().any(|s| s == subnet_id))
            .or_else(|| self.route_tables.iter().find(|rt| rt.main))
    }

    pub fn main_route_table(&self) -> Option<&RouteTableInfo> {
        self.route_tables.iter().find(|rt| rt.main)
    }

    pub fn subnet(&self, subnet_id: &str) -> Option<&SubnetInfo> {
        self.subnets.iter().find(|s| s.id == subnet_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub id: String,
    /// Value of the `Name` tag, empty when untagged
    pub name: String,
    pub cidr: String,
    pub availability_zone: String,
    pub state: String,
    pub map_public_ip: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTableInfo {
    pub id: String,
    pub main: bool,
    /// Explicitly associated subnets
    pub subnet_ids: Vec<String>,
    pub routes: Vec<RouteInfo>,
}

impl RouteTableInfo {
    /// Has a route through an internet gateway
    pub fn routes_to_internet_gateway(&self) -> bool {
        self.routes.iter().any(|r| {
            r.gateway_id
                .as_deref()
                .is_some_and(|g| g.starts_with("igw-"))
        })
    }

    /// Has a `0.0.0.0/0` route through an internet gateway
    pub fn has_default_internet_route(&self) -> bool {
        self.routes.iter().any(|r| {
            r.destination == "0.0.0.0/0"
                && r.gateway_id
                    .as_deref()
                    .is_some_and(|g| g.starts_with("igw-"))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub destination: String,
    pub gateway_id: Option<String>,
    pub nat_gateway_id: Option<String>,
}

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Multiply the previous delay
    Exponential(f64),
    /// Add a fixed step per attempt
    Linear(Duration),
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Growth between retries
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::throttling()
    }
}

impl RetryConfig {
    /// Throttled API calls: 1s, 2s, 4s, ... capped at 30s
    pub fn throttling() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential(2.0),
        }
    }

    /// Deletions blocked by draining dependants: 15s, 30s, 45s, ...
    pub fn dependency_drain() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(120),
            backoff: Backoff::Linear(Duration::from_secs(15)),
        }
    }

    /// No waiting at all
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Linear(Duration::ZERO),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Exponential(multiplier) => {
                let secs = self.initial_delay.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
            }
            Backoff::Linear(step) => self.initial_delay + step * attempt,
        };
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_delays() {
        let config = RetryConfig::throttling();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_dependency_drain_delays() {
        let config = RetryConfig::dependency_drain();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(15));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(45));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(120));
    }

    #[test]
    fn test_immediate_has_no_delay() {
        let config = RetryConfig::immediate(3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn test_route_table_for_falls_back_to_main() {
        let snapshot = NetworkSnapshot {
            subnets: vec![],
            route_tables: vec![
                RouteTableInfo {
                    id: "rtb-main".into(),
                    main: true,
                    subnet_ids: vec![],
                    routes: vec![],
                },
                RouteTableInfo {
                    id: "rtb-public".into(),
                    main: false,
                    subnet_ids: vec!["subnet-a".into()],
                    routes: vec![RouteInfo {
                        destination: "0.0.0.0/0".into(),
                        gateway_id: Some("igw-1".into()),
                        nat_gateway_id: None,
                    }],
                },
            ],
        };
        let public = snapshot.route_table_for("subnet-a").unwrap();
        assert_eq!(public.id, "rtb-public");
        assert!(public.has_default_internet_route());
        assert_eq!(snapshot.route_table_for("subnet-b").unwrap().id, "rtb-main");
    }

    #[test]
    fn test_invocation_states() {
        let running = Invocation {
            status: "InProgress".into(),
            ..Default::default()
        };
        assert!(!running.is_finished());
        let done = Invocation {
            status: "Success".into(),
            ..Default::default()
        };
        assert!(done.is_finished() && done.is_success());
    }
}
