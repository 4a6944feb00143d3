//! HTTP readiness probe for the public entry point

use crate::error::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROGRESS_EVERY: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One GET against a URL
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// Status code, or `None` when no response arrived
    async fn get(&self, url: &str) -> Result<Option<u16>>;
}

pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get(&self, url: &str) -> Result<Option<u16>> {
        match self.client.get(url).send().await {
            Ok(response) => Ok(Some(response.status().as_u16())),
            Err(err) => {
                debug!(url, "Connection attempt failed: {}", err);
                Ok(None)
            }
        }
    }
}

/// Answers every request with the same status; used by `--dry-run`
pub struct StaticProbe(pub u16);

#[async_trait]
impl HttpProbe for StaticProbe {
    async fn get(&self, _url: &str) -> Result<Option<u16>> {
        Ok(Some(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready(u16),
    TimedOut,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }
}

/// Gateway errors mean the origin is still coming up
fn in_progress(code: u16) -> bool {
    matches!(code, 502..=504)
}

/// Poll `https://{domain}` until it answers with anything but a gateway error
///
/// Running out of attempts is not an error; the caller only gets
/// [`Readiness::TimedOut`] and a warning is logged.
pub async fn check_application_ready(
    probe: &dyn HttpProbe,
    domain: &str,
    attempts: u32,
    interval: Duration,
) -> Result<Readiness> {
    let url = format!("https://{}", domain);
    let attempts = attempts.max(1);
    info!(
        "Checking {} ({} attempts, {:?} apart)",
        url, attempts, interval
    );

    let started = Instant::now();
    let mut last_progress = started;

    for attempt in 1..=attempts {
        let outcome = probe.get(&url).await?;
        if let Some(code) = outcome.filter(|code| !in_progress(*code)) {
            let elapsed = started.elapsed().as_secs_f64() / 60.0;
            if code == 200 {
                info!("✓ Application is ready! Status code: {}", code);
            } else {
                info!("Application responded with HTTP {}, considering it ready", code);
            }
            info!(
                "  Total attempts: {}/{}, elapsed time: {:.1} minutes",
                attempt, attempts, elapsed
            );
            return Ok(Readiness::Ready(code));
        }

        let detail = match outcome {
            Some(code) => format!("HTTP {} response", code),
            None => "Connection attempt".to_string(),
        };
        let now = Instant::now();
        if attempt == 1 || attempt + 10 > attempts || now - last_progress >= PROGRESS_EVERY {
            info!("  In progress... [{}/{}] - {}", attempt, attempts, detail);
            last_progress = now;
        } else {
            debug!(attempt, attempts, "Application not ready yet: {}", detail);
        }

        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    warn!(
        "Application readiness check timed out after {:?} ({:.1} minutes)",
        interval * attempts,
        started.elapsed().as_secs_f64() / 60.0
    );
    warn!("The application may still be deploying. Please check manually.");
    Ok(Readiness::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted(Mutex<VecDeque<Option<u16>>>);

    impl Scripted {
        fn new(answers: &[Option<u16>]) -> Self {
            Self(Mutex::new(answers.iter().copied().collect()))
        }
    }

    #[async_trait]
    impl HttpProbe for Scripted {
        async fn get(&self, _url: &str) -> Result<Option<u16>> {
            Ok(self.0.lock().unwrap().pop_front().flatten())
        }
    }

    #[tokio::test]
    async fn test_gateway_errors_then_ready() {
        let probe = Scripted::new(&[None, Some(502), Some(503), Some(200)]);
        let result = check_application_ready(&probe, "d123.cloudfront.net", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(result, Readiness::Ready(200));
    }

    #[tokio::test]
    async fn test_other_codes_count_as_ready() {
        let probe = Scripted::new(&[Some(504), Some(404)]);
        let result = check_application_ready(&probe, "d123.cloudfront.net", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(result, Readiness::Ready(404));
    }

    #[tokio::test]
    async fn test_timeout_is_not_an_error() {
        let probe = Scripted::new(&[Some(502), Some(502), Some(502)]);
        let result = check_application_ready(&probe, "d123.cloudfront.net", 3, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(result, Readiness::TimedOut);
        assert!(!result.is_ready());
    }
}
