//! AWS provider for agentstack
//!
//! This crate implements the [`CloudProvider`](agentstack_cloud::CloudProvider)
//! and [`RemoteShell`](agentstack_cloud::RemoteShell) traits on top of the
//! `aws` CLI.
//!
//! # Services
//!
//! - S3 buckets, IAM roles and instance profiles, Secrets Manager
//! - OpenSearch Serverless policies, collections and the vector index
//! - Bedrock knowledge bases and data sources
//! - EC2 networking, instances and images; SSM run-command
//! - Application load balancers and CloudFront
//!
//! # Requirements
//!
//! - `aws` CLI v2 must be installed and configured
//! - Credentials are whatever the CLI resolves (profile, SSO, environment);
//!   signed data-plane requests read the same sources through `aws-config`
//!
//! # Example
//!
//! ```ignore
//! use agentstack_cloud::CloudProvider;
//! use agentstack_cloud_aws::AwsProvider;
//!
//! let provider = AwsProvider::new("us-west-2")?;
//!
//! let auth = provider.check_auth().await?;
//! if !auth.authenticated {
//!     panic!("Not authenticated: {:?}", auth.error);
//! }
//! ```

pub mod balancer;
pub mod cdn;
pub mod cli;
pub mod compute;
pub mod error;
pub mod iam;
pub mod knowledge;
pub mod network;
pub mod provider;
pub mod search;
pub mod secrets;
pub mod sigv4;
pub mod storage;

pub use cli::AwsCli;
pub use error::{AwsError, ErrorClass, Result, classify};
pub use provider::AwsProvider;
