use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::TelemetryCollector;
use crate::config::{Config, BACKFILL_DAY_PAUSE_MS, MAX_BACKFILL_DAYS};
use crate::normalizer;
use crate::sink::Sink;
use crate::types::{CycleOutcome, CycleResult, EndpointSpec, TimeWindow, Trigger};

const DAY_SECS: i64 = 86_400;

/// One full fetch -> normalize -> deliver pass, as seen by the scheduler.
#[async_trait]
pub trait CycleExecutor: Send + Sync {
    async fn execute(&self, trigger: Trigger, cancel: CancellationToken) -> CycleResult;
}

pub struct CycleRunner {
    collector: TelemetryCollector,
    sink: Arc<dyn Sink>,
    endpoints: Vec<EndpointSpec>,
    system_id: u64,
    timezone: Tz,
    interval_secs: u64,
    lookback_secs: i64,
    backfill_pause: Duration,
    /// Newest timestamp this process has delivered; fallback for sinks that
    /// cannot report their own.
    watermark: Mutex<Option<i64>>,
}

impl CycleRunner {
    pub fn new(cfg: &Config, collector: TelemetryCollector, sink: Arc<dyn Sink>) -> Self {
        Self {
            collector,
            sink,
            endpoints: EndpointSpec::catalogue(),
            system_id: cfg.system_id,
            timezone: cfg.timezone,
            interval_secs: cfg.interval_secs,
            lookback_secs: cfg.lookback_secs,
            backfill_pause: Duration::from_millis(BACKFILL_DAY_PAUSE_MS),
            watermark: Mutex::new(None),
        }
    }

    pub fn with_backfill_pause(mut self, pause: Duration) -> Self {
        self.backfill_pause = pause;
        self
    }

    /// `[now - lookback, now]`. The whole lookback is re-read every cycle so an
    /// endpoint that failed earlier gets its intervals filled in; the sink
    /// dedups. The watermark only serves to detect gaps older than that.
    pub async fn next_window(&self, now: i64) -> TimeWindow {
        let floor = now - self.lookback_secs;

        let watermark = match self.sink.latest_timestamp(self.system_id).await {
            Ok(Some(ts)) => Some(ts),
            Ok(None) => *self.watermark.lock().await,
            Err(e) => {
                warn!(sink = self.sink.name(), error = %e, "Could not read sink watermark");
                *self.watermark.lock().await
            }
        };

        if let Some(w) = watermark.filter(|&w| w < floor) {
            let gap_days = (floor - w) as f64 / DAY_SECS as f64;
            warn!(
                watermark = w,
                gap_days,
                "Data gap of {gap_days:.1} days beyond the lookback window; run a backfill to recover it",
            );
        }
        TimeWindow::new(floor, now)
    }

    /// Run one pass over `window`. Never fails: every outcome lands in the result.
    pub async fn run_window(&self, window: TimeWindow, cancel: &CancellationToken) -> CycleResult {
        let started = Instant::now();
        let mut result = CycleResult::new(window, Utc::now());
        result.attempted_endpoints = self.endpoints.iter().map(|e| e.telemetry_type).collect();

        let collected = self.collector.collect(&self.endpoints, &window, cancel).await;
        result.succeeded_endpoints = collected.payloads.keys().copied().collect();
        result.auth_failed = collected.auth_failed();
        result.failed_endpoints = collected
            .failures
            .iter()
            .map(|(t, e)| (*t, e.to_string()))
            .collect();

        if cancel.is_cancelled() {
            result.cancelled = true;
        } else {
            let records = normalizer::merge(&collected.payloads, self.system_id, self.timezone, self.interval_secs);
            if !records.is_empty() {
                let report = tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = self.sink.deliver(&records) => Some(r),
                };
                match report {
                    None => result.cancelled = true,
                    Some(report) => {
                        result.records_delivered = report.delivered_count;
                        match report.error {
                            Some(e) => result.delivery_error = Some(e.to_string()),
                            None => {
                                if let Some(last) = records.last() {
                                    let mut wm = self.watermark.lock().await;
                                    *wm = Some(wm.map_or(last.timestamp_utc, |w| w.max(last.timestamp_utc)));
                                }
                            }
                        }
                    }
                }
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// `days` consecutive one-day windows ending at `now`, oldest first.
    pub async fn backfill(&self, days: u32, now: i64, cancel: &CancellationToken) -> CycleResult {
        let days = days.clamp(1, MAX_BACKFILL_DAYS);
        let windows: Vec<TimeWindow> = (0..days as i64)
            .rev()
            .map(|i| {
                let end = now - i * DAY_SECS;
                TimeWindow::new(end - DAY_SECS, end)
            })
            .collect();

        info!(days, "Starting backfill of {days} days");
        let started = Instant::now();
        let mut aggregate: Option<CycleResult> = None;

        for (i, window) in windows.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.backfill_pause) => {}
                }
            }
            if cancel.is_cancelled() {
                let agg = aggregate.get_or_insert_with(|| CycleResult::new(*window, Utc::now()));
                agg.cancelled = true;
                break;
            }

            let day = self.run_window(*window, cancel).await;
            info!(
                day = i + 1,
                of = days,
                records = day.records_delivered,
                outcome = %day.outcome(),
                "Backfill day complete",
            );
            match aggregate.as_mut() {
                Some(agg) => agg.absorb(day),
                None => aggregate = Some(day),
            }
        }

        let mut result = aggregate.unwrap_or_else(|| CycleResult::new(TimeWindow::new(now, now), Utc::now()));
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }
}

#[async_trait]
impl CycleExecutor for CycleRunner {
    async fn execute(&self, trigger: Trigger, cancel: CancellationToken) -> CycleResult {
        let now = Utc::now().timestamp();
        let result = match trigger {
            Trigger::Timer | Trigger::Manual => {
                let window = self.next_window(now).await;
                info!(%trigger, start_at = window.start_at, end_at = window.end_at, "Cycle started");
                self.run_window(window, &cancel).await
            }
            Trigger::Backfill { days } => self.backfill(days, now, &cancel).await,
        };
        log_outcome(trigger, &result);
        result
    }
}

pub fn log_outcome(trigger: Trigger, r: &CycleResult) {
    let failed: Vec<String> = r.failed_endpoints.iter().map(|(t, e)| format!("{t}: {e}")).collect();
    match r.outcome() {
        CycleOutcome::Success => info!(
            %trigger,
            records = r.records_delivered,
            duration_ms = r.duration_ms,
            "Cycle succeeded: {} records from {} endpoints",
            r.records_delivered,
            r.succeeded_endpoints.len(),
        ),
        CycleOutcome::Partial => warn!(
            %trigger,
            records = r.records_delivered,
            duration_ms = r.duration_ms,
            failed = ?failed,
            "Cycle partially succeeded: {}/{} endpoints",
            r.succeeded_endpoints.len(),
            r.attempted_endpoints.len(),
        ),
        CycleOutcome::Failure => error!(
            %trigger,
            duration_ms = r.duration_ms,
            auth_failed = r.auth_failed,
            cancelled = r.cancelled,
            delivery_error = r.delivery_error.as_deref().unwrap_or(""),
            failed = ?failed,
            "Cycle failed",
        ),
    }
}
