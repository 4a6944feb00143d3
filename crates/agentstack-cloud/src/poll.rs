//! Readiness poller
//!
//! Sleep-poll loops in the calling task. There is no cancellation other than
//! dropping the future.

use crate::error::{CloudError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Log a progress line every this many polls
const PROGRESS_EVERY: u32 = 6;

/// Interval and budget for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    /// Derived from `timeout / interval`, or set directly for zero intervals
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let max_attempts = if interval.is_zero() {
            1
        } else {
            timeout.as_millis().div_ceil(interval.as_millis()).max(1) as u32
        };
        Self {
            interval,
            timeout,
            max_attempts,
        }
    }

    /// `attempts` polls at the given interval
    pub fn attempts(interval: Duration, attempts: u32) -> Self {
        Self {
            interval,
            timeout: interval * attempts,
            max_attempts: attempts.max(1),
        }
    }

    /// `attempts` polls without sleeping
    pub fn immediate(attempts: u32) -> Self {
        Self::attempts(Duration::ZERO, attempts)
    }
}

/// Status values that end a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalStates {
    pub active: Vec<String>,
    pub failed: Vec<String>,
}

impl TerminalStates {
    pub fn new(active: &[&str], failed: &[&str]) -> Self {
        Self {
            active: active.iter().map(|s| s.to_string()).collect(),
            failed: failed.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// `ACTIVE` / `FAILED` (collections, knowledge bases)
    pub fn active_or_failed() -> Self {
        Self::new(&["ACTIVE"], &["FAILED"])
    }

    /// `available` / `failed` (subnets, NAT gateways)
    pub fn available_or_failed() -> Self {
        Self::new(&["available"], &["failed", "deleted"])
    }

    /// `running` (instances)
    pub fn running() -> Self {
        Self::new(&["running"], &["terminated", "shutting-down"])
    }

    /// `terminated` / `deleted`
    pub fn gone() -> Self {
        Self::new(&["terminated", "deleted"], &[])
    }

    pub fn is_active(&self, status: &str) -> bool {
        self.active.iter().any(|s| s.eq_ignore_ascii_case(status))
    }

    pub fn is_failed(&self, status: &str) -> bool {
        self.failed.iter().any(|s| s.eq_ignore_ascii_case(status))
    }
}

/// Poll `probe` until it reports an active status
///
/// Returns the active status. A failed status is a precondition failure;
/// running out of attempts is a timeout.
pub async fn await_active<F, Fut>(
    what: &str,
    policy: &PollPolicy,
    terminal: &TerminalStates,
    mut probe: F,
) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    for attempt in 1..=policy.max_attempts {
        let status = probe().await?;
        if terminal.is_active(&status) {
            debug!(what, %status, attempt, "Reached active state");
            return Ok(status);
        }
        if terminal.is_failed(&status) {
            return Err(CloudError::Precondition(format!(
                "{} reached failed state {}",
                what, status
            )));
        }
        if attempt % PROGRESS_EVERY == 0 {
            info!(what, %status, "Still waiting ({}/{})", attempt, policy.max_attempts);
        } else {
            debug!(what, %status, attempt, "Waiting");
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(CloudError::Timeout(format!(
        "{} did not become ready within {:?}",
        what, policy.timeout
    )))
}

/// Poll `probe` until the resource is gone
///
/// `Ok(None)` and a NotFound error both count as absence.
pub async fn await_absent<T, F, Fut>(what: &str, policy: &PollPolicy, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        match probe().await {
            Ok(None) => return Ok(()),
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
            Ok(Some(_)) => {
                debug!(what, attempt, "Still present");
            }
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(CloudError::Timeout(format!(
        "{} still present after {:?}",
        what, policy.timeout
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_policy_attempts_from_timeout() {
        let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(600));
        assert_eq!(policy.max_attempts, 60);

        let policy = PollPolicy::new(Duration::from_secs(30), Duration::from_secs(300));
        assert_eq!(policy.max_attempts, 10);
    }

    #[tokio::test]
    async fn test_await_active_case_insensitive() {
        let statuses = Mutex::new(vec!["CREATING", "CREATING", "active"].into_iter());
        let status = await_active(
            "collection demo",
            &PollPolicy::immediate(5),
            &TerminalStates::active_or_failed(),
            || {
                let next = statuses.lock().unwrap().next().unwrap_or("CREATING");
                async move { Ok(next.to_string()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(status, "active");
    }

    #[tokio::test]
    async fn test_await_active_failed_state() {
        let err = await_active(
            "knowledge base demo",
            &PollPolicy::immediate(5),
            &TerminalStates::active_or_failed(),
            || async { Ok("FAILED".to_string()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CloudError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_await_active_timeout() {
        let err = await_active(
            "nat gateway",
            &PollPolicy::immediate(3),
            &TerminalStates::available_or_failed(),
            || async { Ok("pending".to_string()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CloudError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_await_absent_on_not_found() {
        let polls = Mutex::new(0);
        await_absent("endpoint", &PollPolicy::immediate(5), || {
            let mut n = polls.lock().unwrap();
            *n += 1;
            let present = *n < 3;
            async move {
                if present {
                    Ok(Some(()))
                } else {
                    Err(CloudError::NotFound("vpce-1".into()))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(*polls.lock().unwrap(), 3);
    }
}
