//! Create-or-skip and delete-with-retry
//!
//! Idempotency is expressed as data: [`ensure`] returns [`Ensured::Created`]
//! or [`Ensured::AlreadyPresent`], [`delete_with_retry`] returns
//! [`Removal::Deleted`] or [`Removal::AlreadyAbsent`]. Only fatal conditions
//! come back as `Err`.

use crate::error::{CloudError, Result};
use crate::provider::{CloudProvider, RetryConfig};
use crate::resource::ResourceDescriptor;
use crate::spec::ResourceSpec;
use std::future::Future;
use tracing::{debug, warn};

/// Outcome of [`ensure`]
#[derive(Debug, Clone, PartialEq)]
pub enum Ensured {
    Created(ResourceDescriptor),
    AlreadyPresent(ResourceDescriptor),
}

impl Ensured {
    pub fn descriptor(&self) -> &ResourceDescriptor {
        match self {
            Ensured::Created(d) | Ensured::AlreadyPresent(d) => d,
        }
    }

    pub fn into_descriptor(self) -> ResourceDescriptor {
        match self {
            Ensured::Created(d) | Ensured::AlreadyPresent(d) => d,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Ensured::Created(_))
    }
}

/// Outcome of [`delete_with_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    AlreadyAbsent,
}

impl std::fmt::Display for Removal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Removal::Deleted => write!(f, "deleted"),
            Removal::AlreadyAbsent => write!(f, "already absent"),
        }
    }
}

/// Run `op`, retrying throttled calls with the configured backoff
pub async fn with_retry<T, F, Fut>(what: &str, retry: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(CloudError::Throttled(msg)) if attempt + 1 < max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    what,
                    attempt = attempt + 1,
                    max_attempts,
                    "Throttled ({}), retrying in {:?}",
                    msg,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Probe for `spec`'s derived name and create it only when absent
///
/// A concurrent-creation conflict re-probes and reports the existing
/// resource. A conflict whose resource still cannot be found is fatal.
pub async fn ensure<P>(provider: &P, spec: &ResourceSpec, retry: &RetryConfig) -> Result<Ensured>
where
    P: CloudProvider + ?Sized,
{
    let kind = spec.kind();
    let name = spec.name();

    if let Some(existing) = with_retry(name, retry, || provider.find(kind, name)).await? {
        debug!(%kind, name, "Already present");
        return Ok(Ensured::AlreadyPresent(existing));
    }

    match with_retry(name, retry, || provider.create(spec)).await {
        Ok(created) => {
            debug!(%kind, name, id = created.id.as_deref().unwrap_or(""), "Created");
            Ok(Ensured::Created(created))
        }
        Err(err) if err.is_conflict() => {
            debug!(%kind, name, "Creation conflict, probing again");
            match with_retry(name, retry, || provider.find(kind, name)).await? {
                Some(existing) => Ok(Ensured::AlreadyPresent(existing)),
                None => Err(CloudError::ApiError(format!(
                    "{} {} reported as existing but could not be found: {}",
                    kind, name, err
                ))),
            }
        }
        Err(err) => Err(err),
    }
}

/// Delete `target`, tolerating absence and retrying transient failures
///
/// "Not found" is success. Dependency violations and throttling are retried
/// until `retry.max_attempts` attempts have been made; the last error is
/// returned after that.
pub async fn delete_with_retry<P>(
    provider: &P,
    target: &ResourceDescriptor,
    retry: &RetryConfig,
) -> Result<Removal>
where
    P: CloudProvider + ?Sized,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match provider.delete(target).await {
            Ok(()) => return Ok(Removal::Deleted),
            Err(err) if err.is_not_found() => {
                debug!(target = %target.label(), "Already absent");
                return Ok(Removal::AlreadyAbsent);
            }
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    target = %target.label(),
                    attempt = attempt + 1,
                    max_attempts,
                    "{}, retrying in {:?}",
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CallOp, MemoryProvider};
    use crate::resource::ResourceKind;

    fn vpc_spec() -> ResourceSpec {
        ResourceSpec::Vpc {
            name: "vpc-for-demo".into(),
            cidr: "10.20.0.0/16".into(),
        }
    }

    #[tokio::test]
    async fn test_ensure_twice_creates_once() {
        let provider = MemoryProvider::new();
        let retry = RetryConfig::immediate(3);

        let first = ensure(&provider, &vpc_spec(), &retry).await.unwrap();
        let second = ensure(&provider, &vpc_spec(), &retry).await.unwrap();

        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.descriptor().id, second.descriptor().id);
        assert_eq!(provider.count(CallOp::Create, ResourceKind::Vpc), 1);
    }

    #[tokio::test]
    async fn test_ensure_conflict_reprobes() {
        let provider = MemoryProvider::new();
        provider.conflict_on_next_create(ResourceKind::Vpc);

        let result = ensure(&provider, &vpc_spec(), &RetryConfig::immediate(3))
            .await
            .unwrap();

        assert!(matches!(result, Ensured::AlreadyPresent(_)));
        assert_eq!(provider.count(CallOp::Find, ResourceKind::Vpc), 2);
    }

    #[tokio::test]
    async fn test_ensure_retries_throttling() {
        let provider = MemoryProvider::new();
        provider.throttle_next_creates(ResourceKind::Vpc, 2);

        let result = ensure(&provider, &vpc_spec(), &RetryConfig::immediate(3))
            .await
            .unwrap();

        assert!(result.was_created());
        assert_eq!(provider.count(CallOp::Create, ResourceKind::Vpc), 3);
    }

    #[tokio::test]
    async fn test_ensure_throttling_exhausted_is_fatal() {
        let provider = MemoryProvider::new();
        provider.throttle_next_creates(ResourceKind::Vpc, 5);

        let err = ensure(&provider, &vpc_spec(), &RetryConfig::immediate(2))
            .await
            .unwrap_err();

        assert!(matches!(err, CloudError::Throttled(_)));
    }

    #[tokio::test]
    async fn test_delete_absent_is_success() {
        let provider = MemoryProvider::new();
        let ghost = ResourceDescriptor::new(ResourceKind::SecurityGroup, "ec2-sg-for-demo")
            .with_id("sg-9999");

        let removal = delete_with_retry(&provider, &ghost, &RetryConfig::immediate(3))
            .await
            .unwrap();

        assert_eq!(removal, Removal::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_delete_dependency_violation_bounded() {
        let provider = MemoryProvider::new();
        let vpc = ensure(&provider, &vpc_spec(), &RetryConfig::immediate(1))
            .await
            .unwrap()
            .into_descriptor();
        provider.block_delete("vpc-for-demo");

        let err = delete_with_retry(&provider, &vpc, &RetryConfig::immediate(4))
            .await
            .unwrap_err();

        assert!(err.is_dependency_violation());
        assert_eq!(provider.count(CallOp::Delete, ResourceKind::Vpc), 4);
    }
}
