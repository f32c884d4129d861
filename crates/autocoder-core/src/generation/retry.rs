//! Provider call controls: retry with exponential backoff behind a circuit breaker.
//!
//! Transient provider failures (network errors, 429, 5xx) are retried here so
//! callers of `CodeGenerator::generate` only ever see the final outcome.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::provider::GenerationError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay (milliseconds).
    pub max_backoff_ms: u64,
    /// Consecutive failures that open the breaker.
    pub breaker_threshold: u32,
    /// How long an open breaker rejects calls before letting one through.
    pub breaker_cooldown_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            max_backoff_ms: 30_000,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Atomic circuit breaker that opens after N consecutive failures.
///
/// While open, calls are rejected until the cooldown has passed; then a
/// single trial call is let through (half-open). A success closes the
/// breaker, a failure re-opens it for another cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
    cooldown_ms: u64,
    epoch: Instant,
    /// Milliseconds since `epoch` when the breaker last opened.
    opened_at_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
            cooldown_ms: cooldown.as_millis() as u64,
            epoch: Instant::now(),
            opened_at_ms: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.breaker_threshold,
            Duration::from_millis(config.breaker_cooldown_ms),
        )
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn tripped(&self) -> bool {
        self.threshold > 0 && self.failure_count() >= self.threshold
    }

    /// Open and still cooling down.
    pub fn is_open(&self) -> bool {
        self.tripped()
            && self.now_ms().saturating_sub(self.opened_at_ms.load(Ordering::Acquire)) < self.cooldown_ms
    }

    /// Whether a call may go out now. After the cooldown exactly one caller
    /// wins the trial; the rest keep seeing an open breaker.
    pub fn allow_request(&self) -> bool {
        if !self.tripped() {
            return true;
        }
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        let now = self.now_ms();
        if now.saturating_sub(opened) < self.cooldown_ms {
            return false;
        }
        self.opened_at_ms
            .compare_exchange(opened, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_failure(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if self.threshold > 0 && failures >= self.threshold {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        }
        failures
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// Run `op` with retry and breaker controls.
///
/// Only errors for which [`GenerationError::is_retryable`] holds are retried
/// or counted against the breaker; any other answer means the provider is up.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    breaker: &CircuitBreaker,
    op: F,
) -> Result<T, GenerationError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 1;
    loop {
        if !breaker.allow_request() {
            return Err(GenerationError::CircuitOpen {
                consecutive_failures: breaker.failure_count(),
            });
        }

        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) => {
                if !err.is_retryable() {
                    breaker.record_success();
                    return Err(err);
                }
                breaker.record_failure();
                if attempt >= max_attempts {
                    return Err(err);
                }
                let delay = config.backoff(attempt);
                warn!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
