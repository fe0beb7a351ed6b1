use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{FETCH_MAX_RETRIES, FETCH_RETRY_BASE_MS};
use crate::error::{AppError, Result};
use crate::fetcher::TelemetrySource;
use crate::types::{EndpointSpec, RawPayload, TelemetryType, TimeWindow};

/// Successes and failures of one fan-out, keyed by telemetry type.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub payloads: BTreeMap<TelemetryType, RawPayload>,
    pub failures: BTreeMap<TelemetryType, AppError>,
}

impl CollectOutcome {
    pub fn auth_failed(&self) -> bool {
        self.failures.values().any(AppError::is_auth)
    }
}

/// Fans one fetch per endpoint out concurrently. Each endpoint retries on its
/// own; one endpoint failing never cancels or delays another.
pub struct TelemetryCollector {
    source: Arc<dyn TelemetrySource>,
    max_retries: u32,
    retry_base: Duration,
}

impl TelemetryCollector {
    pub fn new(source: Arc<dyn TelemetrySource>) -> Self {
        Self {
            source,
            max_retries: FETCH_MAX_RETRIES,
            retry_base: Duration::from_millis(FETCH_RETRY_BASE_MS),
        }
    }

    pub fn with_retry(mut self, max_retries: u32, retry_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = retry_base;
        self
    }

    pub async fn collect(
        &self,
        endpoints: &[EndpointSpec],
        window: &TimeWindow,
        cancel: &CancellationToken,
    ) -> CollectOutcome {
        let tasks = endpoints.iter().map(|spec| async move {
            let result = self.fetch_with_retry(spec, window, cancel).await;
            (spec.telemetry_type, result)
        });

        let mut outcome = CollectOutcome::default();
        for (telemetry_type, result) in join_all(tasks).await {
            match result {
                Ok(payload) => {
                    outcome.payloads.insert(telemetry_type, payload);
                }
                Err(e) => {
                    warn!(telemetry_type = %telemetry_type, error = %e, "Endpoint failed");
                    outcome.failures.insert(telemetry_type, e);
                }
            }
        }

        info!(
            succeeded = outcome.payloads.len(),
            failed = outcome.failures.len(),
            "Collected {}/{} endpoints",
            outcome.payloads.len(),
            endpoints.len(),
        );
        outcome
    }

    async fn fetch_with_retry(
        &self,
        spec: &EndpointSpec,
        window: &TimeWindow,
        cancel: &CancellationToken,
    ) -> Result<RawPayload> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                r = self.source.fetch(spec, window) => r,
            };

            match result {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.retry_base * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        telemetry_type = %spec.telemetry_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient fetch error, retrying",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{payload, ScriptedSource};
    use super::*;
    use crate::types::{IntervalReading, Reading};

    fn production() -> RawPayload {
        payload(
            TelemetryType::Production,
            vec![IntervalReading {
                end_at: 100,
                devices_reporting: 1,
                reading: Reading::Production { wh_del: Some(50.0) },
            }],
        )
    }

    fn collector(source: Arc<ScriptedSource>) -> TelemetryCollector {
        TelemetryCollector::new(source).with_retry(2, Duration::from_millis(1))
    }

    fn four_endpoints() -> Vec<EndpointSpec> {
        [
            TelemetryType::Production,
            TelemetryType::Consumption,
            TelemetryType::Battery,
            TelemetryType::Import,
        ]
        .into_iter()
        .map(EndpointSpec::for_type)
        .collect()
    }

    fn unavailable() -> AppError {
        AppError::HttpStatus { status: 503, body: "unavailable".into() }
    }

    #[tokio::test]
    async fn one_failing_endpoint_leaves_three_payloads() {
        let source = Arc::new(
            ScriptedSource::default()
                .script(TelemetryType::Production, vec![Ok(production())])
                .script(TelemetryType::Import, vec![Err(unavailable())]),
        );
        let out = collector(source.clone())
            .collect(&four_endpoints(), &TimeWindow::new(0, 1000), &CancellationToken::new())
            .await;

        assert_eq!(out.payloads.len(), 3);
        assert_eq!(out.failures.len(), 1);
        assert!(matches!(
            out.failures.get(&TelemetryType::Import),
            Some(AppError::HttpStatus { status: 503, .. })
        ));
        // One attempt plus two retries.
        assert_eq!(source.calls(TelemetryType::Import), 3);
        assert_eq!(source.calls(TelemetryType::Production), 1);
        assert!(!out.auth_failed());
    }

    #[tokio::test]
    async fn transient_error_recovers_within_retry_budget() {
        let source = Arc::new(ScriptedSource::default().script(
            TelemetryType::Production,
            vec![Err(unavailable()), Err(AppError::Timeout), Ok(production())],
        ));
        let out = collector(source.clone())
            .collect(
                &[EndpointSpec::for_type(TelemetryType::Production)],
                &TimeWindow::new(0, 1000),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(out.payloads.get(&TelemetryType::Production), Some(&production()));
        assert!(out.failures.is_empty());
        assert_eq!(source.calls(TelemetryType::Production), 3);
    }

    #[tokio::test]
    async fn client_and_auth_errors_are_not_retried() {
        let source = Arc::new(
            ScriptedSource::default()
                .script(
                    TelemetryType::Battery,
                    vec![Err(AppError::HttpStatus { status: 403, body: "forbidden".into() })],
                )
                .script(TelemetryType::Consumption, vec![Err(AppError::Auth("revoked".into()))]),
        );
        let out = collector(source.clone())
            .collect(&four_endpoints(), &TimeWindow::new(0, 1000), &CancellationToken::new())
            .await;

        assert_eq!(source.calls(TelemetryType::Battery), 1);
        assert_eq!(source.calls(TelemetryType::Consumption), 1);
        assert!(out.auth_failed());
    }

    #[tokio::test]
    async fn cancellation_stops_in_flight_fetches() {
        let source = Arc::new(ScriptedSource::default().with_delay(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let out = collector(source)
            .collect(&four_endpoints(), &TimeWindow::new(0, 1000), &cancel)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.failures.len(), 4);
        assert!(out.failures.values().all(|e| matches!(e, AppError::Cancelled)));
    }
}
