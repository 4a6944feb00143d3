//! agentstack Cloud Infrastructure
//!
//! This crate provides the provider abstraction used by the agentstack
//! provisioner and teardown orchestrators.
//!
//! # Building blocks
//!
//! - **Resource model**: [`ResourceDescriptor`], [`ResourceKind`] and the
//!   closed [`ResourceSpec`] / [`Setting`] variants
//! - **Provider seam**: [`CloudProvider`] and [`RemoteShell`]
//! - **Idempotency**: [`ensure`] (create-or-skip) and [`delete_with_retry`]
//! - **Waiting**: [`await_active`] / [`await_absent`]
//! - **Persistence**: [`ConfigStore`] for the deployment config file
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 agentstack CLI                  │
//! │           (install / uninstall / replay)        │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                agentstack-deploy                │
//! │        Provisioner (11 stages) / Teardown       │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                agentstack-cloud                 │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait CloudProvider / RemoteShell       │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌────────────┐ ┌───────────┐ ┌─────────────┐   │
//! │  │ ensure /   │ │  poller   │ │ ConfigStore │   │
//! │  │ retry      │ │           │ │             │   │
//! │  └────────────┘ └───────────┘ └─────────────┘   │
//! └───────┬─────────────────────┬───────────────────┘
//!         │                     │
//! ┌───────▼────────┐    ┌───────▼────────┐
//! │ aws (aws CLI)  │    │ memory (tests, │
//! │                │    │   --dry-run)   │
//! └────────────────┘    └────────────────┘
//! ```

pub mod ensure;
pub mod error;
pub mod memory;
pub mod poll;
pub mod provider;
pub mod report;
pub mod resource;
pub mod spec;
pub mod state;

// Re-exports
pub use ensure::{Ensured, Removal, delete_with_retry, ensure, with_retry};
pub use error::{CloudError, Result};
pub use memory::{Call, CallOp, MemoryProvider};
pub use poll::{PollPolicy, TerminalStates, await_absent, await_active};
pub use provider::{
    AuthStatus, Backoff, CloudProvider, Invocation, NetworkSnapshot, RemoteShell, RetryConfig,
    RouteInfo, RouteTableInfo, SubnetInfo,
};
pub use report::{RemovalEntry, TeardownReport};
pub use resource::{ResourceCategory, ResourceDescriptor, ResourceKind, ResourceStatus, attr};
pub use spec::{
    IngressRule, InlinePolicy, PolicyType, ResourceSpec, RouteTarget, Setting,
};
pub use state::{ConfigStore, DeploymentConfig};
