//! Readiness probing over plain HTTP.
//!
//! A probe polls one URL until it answers with the expected status or the
//! overall budget runs out. Individual attempt errors (refused, reset, timed
//! out, wrong status) are retried; only an exhausted budget is a failure, and
//! it carries the last observed error.

use std::time::{Duration, Instant};

use blobcheck_core::ProbeSpec;
use tracing::debug;

/// Probe failures.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{url} not ready after {elapsed_ms}ms ({attempts} attempt(s)); last error: {last_error}")]
    Timeout {
        url: String,
        elapsed_ms: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid probe url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("http client error: {0}")]
    Client(String),
}

/// Timing and expectation for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub expected_status: u16,
    pub timeout: Duration,
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl ProbeConfig {
    /// Per-attempt bound, kept strictly below the overall budget.
    pub fn effective_attempt_timeout(&self) -> Duration {
        let ceiling = self
            .timeout
            .checked_sub(Duration::from_millis(1))
            .unwrap_or_default();
        self.attempt_timeout
            .min(ceiling)
            .max(Duration::from_millis(1))
    }
}

impl From<&ProbeSpec> for ProbeConfig {
    fn from(spec: &ProbeSpec) -> Self {
        Self {
            expected_status: spec.expected_status,
            timeout: Duration::from_millis(spec.timeout_ms),
            interval: Duration::from_millis(spec.interval_ms),
            attempt_timeout: Duration::from_millis(spec.attempt_timeout_ms),
        }
    }
}

/// Successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSuccess {
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// HTTP readiness prober.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("blobcheck/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    /// Poll `url` until it returns the expected status or the budget expires.
    pub async fn wait(&self, url: &str, config: &ProbeConfig) -> Result<ProbeSuccess, ProbeError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| ProbeError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let start = Instant::now();
        let deadline = start + config.timeout;
        let per_attempt = config.effective_attempt_timeout();
        let mut attempts = 0u32;
        let mut last_error = "no attempt made".to_string();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let bound = per_attempt.min(deadline - now);
            attempts += 1;

            let request = self.client.get(parsed.clone()).timeout(bound).send();
            match tokio::time::timeout(bound, request).await {
                Ok(Ok(response)) if response.status().as_u16() == config.expected_status => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    debug!(url = %url, attempts, elapsed_ms, "probe succeeded");
                    return Ok(ProbeSuccess {
                        attempts,
                        elapsed_ms,
                    });
                }
                Ok(Ok(response)) => {
                    last_error = format!(
                        "unexpected status {} (want {})",
                        response.status().as_u16(),
                        config.expected_status
                    );
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("attempt timed out after {}ms", bound.as_millis()),
            }
            debug!(url = %url, attempt = attempts, error = %last_error, "probe attempt failed");

            if Instant::now() + config.interval >= deadline {
                break;
            }
            tokio::time::sleep(config.interval).await;
        }

        Err(ProbeError::Timeout {
            url: url.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
            attempts,
            last_error,
        })
    }
}
