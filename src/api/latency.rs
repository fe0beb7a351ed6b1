//! Wall-clock duration of completed cycles, fetch through delivery.
//! The scheduler records one sample per cycle; `/stats/latency` reads.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::{AppError, Result};

const MAX_CYCLE_MS: u64 = 24 * 3_600_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleLatency {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

pub struct LatencyStats {
    cycles: Mutex<Histogram<u64>>,
}

impl LatencyStats {
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, MAX_CYCLE_MS, 3)
            .map_err(|e| AppError::Config(format!("latency histogram: {e}")))?;
        Ok(Self { cycles: Mutex::new(histogram) })
    }

    /// Sub-millisecond cycles (nothing to fetch) count as 1ms; cycles longer
    /// than a day are dropped.
    pub fn record_cycle(&self, took: Duration) {
        let ms = u64::try_from(took.as_millis()).unwrap_or(u64::MAX).max(1);
        if let Ok(mut h) = self.cycles.lock() {
            let _ = h.record(ms);
        }
    }

    pub fn summary(&self) -> CycleLatency {
        let Ok(h) = self.cycles.lock() else {
            return CycleLatency::default();
        };
        if h.is_empty() {
            return CycleLatency::default();
        }
        CycleLatency {
            samples: h.len(),
            p50_ms: Some(h.value_at_quantile(0.5)),
            p95_ms: Some(h.value_at_quantile(0.95)),
            p99_ms: Some(h.value_at_quantile(0.99)),
        }
    }
}
