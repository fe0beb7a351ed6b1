pub mod batch;
pub mod stream;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{DELIVERY_MAX_ATTEMPTS, DELIVERY_RETRY_BASE_MS, DELIVERY_RETRY_MAX_MS};
use crate::error::{AppError, Result};
use crate::types::{DeliveryReport, UnifiedRecord};

pub use batch::BatchIngestSink;
pub use stream::StreamSink;

/// Downstream delivery target. One `deliver` call carries one cycle's records
/// in ascending timestamp order and resends the whole batch on retry.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, records: &[UnifiedRecord]) -> DeliveryReport;

    /// Newest `timestamp_utc` already stored for `system_id`, for sinks that
    /// can answer. Stream sinks cannot.
    async fn latest_timestamp(&self, _system_id: u64) -> Result<Option<i64>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DELIVERY_MAX_ATTEMPTS,
            base: Duration::from_millis(DELIVERY_RETRY_BASE_MS),
            max_delay: Duration::from_millis(DELIVERY_RETRY_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): base, 2x, 4x, ... capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. `delivered_count` is the batch size on success and zero otherwise,
/// however many times the batch was resent.
pub(crate) async fn deliver_with_retry<F, Fut>(
    sink: &'static str,
    policy: &RetryPolicy,
    batch_len: usize,
    mut op: F,
) -> DeliveryReport
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(()) => {
                info!(sink, records = batch_len, attempts = attempt, "Delivered batch");
                return DeliveryReport { delivered_count: batch_len, attempts: attempt, error: None };
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    sink,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient delivery error, retrying",
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let kind = if e.is_transient() { "retries exhausted" } else { "permanent error" };
                warn!(sink, attempts = attempt, error = %e, "Delivery failed ({kind})");
                return DeliveryReport {
                    delivered_count: 0,
                    attempts: attempt,
                    error: Some(AppError::Delivery(format!("{sink}: {e} ({kind} after {attempt} attempts)"))),
                };
            }
        }
    }
}
