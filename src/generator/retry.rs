//! Transport-level retry with exponential backoff.
//!
//! [`RetryingGenerator`] retries a single generation call on transient
//! errors before the error ever reaches the sample. Backoff sleeps are
//! accounted as waits on [`RATE_LIMIT_RESOURCE`] and every failed attempt
//! is reported as retryable, so neither counts against the sample's
//! working time.
//!
//! This is distinct from sample-level retry
//! ([`RetryController`](crate::retry::RetryController)), which re-runs the
//! sample's plan after an error escapes the transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::limits::{LimitTracker, TrackerEvent};
use crate::telemetry;
use crate::traits::ModelGenerator;
use crate::types::{GenerateRequest, ModelOutput};
use crate::Result;

/// Resource name under which backoff sleeps are accounted.
pub const RATE_LIMIT_RESOURCE: &str = "model:rate-limit";

/// Configuration for retry behaviour on transient errors.
///
/// Uses exponential backoff capped at `max_delay`; a provider `retry_after`
/// hint takes precedence over the computed delay.
///
/// ```rust
/// # use evalrun::generator::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200));
/// assert_eq!(config.delay_for_attempt(2), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry, in seconds in config files.
    /// Default: 500ms.
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    #[serde(with = "secs")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt + 1` (0-indexed):
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// The computed delay, unless the provider asked for a specific one.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

/// Decorator that wraps a [`ModelGenerator`] with transport retries.
pub struct RetryingGenerator {
    inner: Arc<dyn ModelGenerator>,
    config: RetryConfig,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn ModelGenerator>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ModelGenerator for RetryingGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn base_url(&self) -> Option<&str> {
        self.inner.base_url()
    }

    async fn generate(
        &self,
        request: &GenerateRequest<'_>,
        tracker: &LimitTracker,
    ) -> Result<ModelOutput> {
        let model = self.inner.name();
        let mut attempt = 0;
        loop {
            match self.inner.generate(request, tracker).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    metrics::counter!(telemetry::TRANSPORT_RETRIES_TOTAL, "model" => model.to_owned())
                        .increment(1);
                    let delay = self.config.effective_delay(attempt, e.retry_after());
                    warn!(
                        model,
                        attempt = attempt + 1,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying generation after transient error"
                    );
                    tracker.account(TrackerEvent::GenerationFailedRetryable);
                    tracker
                        .wait_for(RATE_LIMIT_RESOURCE, tokio::time::sleep(delay))
                        .await;
                    tracker.account(TrackerEvent::GenerationStarted);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `Duration` as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
