//! Block retry with exponential backoff
//!
//! Transient failures (network, rate limiting, deadlines) retry with
//! exponential backoff; a definitive rejection aborts immediately. Defaults
//! per the engine configuration: base 500 ms, cap 10 s, 5 attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use drivemesh_core::config::TransferConfig;
use drivemesh_core::domain::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 10_000,
            attempts: 5,
        }
    }
}

impl From<&TransferConfig> for RetryPolicy {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            base_ms: cfg.retry_base_ms,
            cap_ms: cfg.retry_cap_ms,
            attempts: cfg.retry_attempts,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(exp.min(self.cap_ms))
    }
}

/// Runs `f`, retrying transient failures up to the policy's attempt budget.
///
/// A rate-limited response waits the server-suggested delay when it is
/// longer than the computed backoff.
pub async fn with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut f: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut last_err: Option<EngineError> = None;

    for attempt in 0..policy.attempts {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt + 1 < policy.attempts => {
                let mut delay = policy.delay(attempt);
                if let EngineError::UpstreamRateLimited { retry_after_secs } = &err {
                    delay = delay.max(Duration::from_secs(*retry_after_secs));
                }
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| EngineError::UpstreamTransient(format!("{operation}: retry budget exhausted"))))
}
