use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::TokenManager;
use crate::config::{Config, HTTP_TIMEOUT_SECS};
use crate::error::{AppError, Result};
use crate::types::{EndpointSpec, IntervalReading, RawPayload, Reading, ResponseShape, TelemetryType, TimeWindow};

/// Anything that can produce one endpoint's payload for a window.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch(&self, spec: &EndpointSpec, window: &TimeWindow) -> Result<RawPayload>;
}

/// One authenticated GET per call. Retries belong to the collector; the only
/// repeat done here is a single re-request after a 401 and token refresh.
pub struct EndpointFetcher {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    system_id: u64,
    granularity: String,
    tokens: Arc<TokenManager>,
    limiter: RateLimiter,
}

impl EndpointFetcher {
    pub fn new(cfg: &Config, tokens: Arc<TokenManager>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            system_id: cfg.system_id,
            granularity: cfg.granularity.clone(),
            tokens,
            limiter: RateLimiter::new(cfg.max_calls_per_minute, Duration::from_secs(60)),
        })
    }

    fn url_for(&self, spec: &EndpointSpec) -> String {
        format!("{}/systems/{}/{}", self.api_url, self.system_id, spec.path)
    }
}

#[async_trait]
impl TelemetrySource for EndpointFetcher {
    async fn fetch(&self, spec: &EndpointSpec, window: &TimeWindow) -> Result<RawPayload> {
        let url = self.url_for(spec);
        let mut token = self.tokens.get_valid_token().await?;
        let mut refreshed = false;
        let started = Instant::now();

        loop {
            self.limiter.acquire().await;

            let resp = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .header("key", &self.api_key)
                .query(&[("granularity", self.granularity.as_str())])
                .query(&[("start_at", window.start_at), ("end_at", window.end_at)])
                .send()
                .await
                .map_err(|e| if e.is_timeout() { AppError::Timeout } else { AppError::Http(e) })?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                info!(telemetry_type = %spec.telemetry_type, "Token rejected, refreshing");
                token = self.tokens.force_refresh(&token).await?;
                refreshed = true;
                continue;
            }

            let body = resp.text().await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            if !status.is_success() {
                let snippet: String = body.chars().take(500).collect();
                warn!(
                    telemetry_type = %spec.telemetry_type,
                    status = status.as_u16(),
                    duration_ms,
                    "API call failed: {}",
                    spec.path,
                );
                return Err(AppError::HttpStatus { status: status.as_u16(), body: snippet });
            }

            let payload = parse_payload(spec, &body)?;
            let devices = payload.intervals.iter().map(|i| i.devices_reporting).max().unwrap_or(0);
            info!(
                telemetry_type = %spec.telemetry_type,
                intervals = payload.intervals.len(),
                devices,
                duration_ms,
                "Retrieved {} intervals from {}",
                payload.intervals.len(),
                spec.path,
            );
            return Ok(payload);
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Sliding-window limiter: at most `max_calls` acquisitions per `period`.
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls.front().is_some_and(|t| now.duration_since(*t) >= self.period) {
                    calls.pop_front();
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                match calls.front() {
                    Some(oldest) => self.period.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Decode one endpoint body. Intervals without a usable `end_at` are skipped;
/// a body that is not JSON or has no `intervals` array is a parse error.
pub fn parse_payload(spec: &EndpointSpec, body: &str) -> Result<RawPayload> {
    let t = spec.telemetry_type;
    let v: Value = serde_json::from_str(body)
        .map_err(|e| AppError::Parse(format!("{t} body is not JSON: {e}")))?;

    let items = v
        .get("intervals")
        .and_then(|i| i.as_array())
        .ok_or_else(|| AppError::Parse(format!("{t} body has no intervals array")))?;

    let flat: Vec<&Value> = match spec.shape {
        ResponseShape::Flat => items.iter().collect(),
        ResponseShape::Nested => items
            .iter()
            .flat_map(|item| match item.as_array() {
                Some(inner) => inner.iter().collect::<Vec<_>>(),
                None => vec![item],
            })
            .collect(),
    };

    let mut intervals = Vec::with_capacity(flat.len());
    let mut skipped = 0usize;
    for item in flat {
        match parse_interval(t, item) {
            Some(interval) => intervals.push(interval),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(telemetry_type = %t, skipped, "Skipped intervals without a valid end_at");
    }

    Ok(RawPayload { telemetry_type: t, intervals })
}

fn parse_interval(t: TelemetryType, item: &Value) -> Option<IntervalReading> {
    let end_at = num_i64(item.get("end_at"))?;
    // Reject instants chrono cannot represent so the normalizer never sees them.
    chrono::DateTime::from_timestamp(end_at, 0)?;

    let (reading, devices) = match t {
        TelemetryType::Production => (
            Reading::Production { wh_del: num_f64(item.get("wh_del")) },
            item.get("devices_reporting"),
        ),
        TelemetryType::Consumption => (
            Reading::Consumption {
                wh_used: num_f64(item.get("enwh")).or_else(|| num_f64(item.get("wh_used"))),
            },
            item.get("devices_reporting"),
        ),
        TelemetryType::Battery => {
            let charge = item.get("charge");
            let discharge = item.get("discharge");
            let soc = item.get("soc");
            (
                Reading::Battery {
                    charge_wh: num_f64(charge.and_then(|c| c.get("enwh"))),
                    discharge_wh: num_f64(discharge.and_then(|d| d.get("enwh"))),
                    soc_percent: num_f64(soc.and_then(|s| s.get("percent"))),
                },
                charge
                    .and_then(|c| c.get("devices_reporting"))
                    .or_else(|| item.get("devices_reporting")),
            )
        }
        TelemetryType::Import => (
            Reading::Import { wh_imported: num_f64(item.get("wh_imported")) },
            item.get("devices_reporting"),
        ),
        TelemetryType::Export => (
            Reading::Export { wh_exported: num_f64(item.get("wh_exported")) },
            item.get("devices_reporting"),
        ),
    };

    Some(IntervalReading {
        end_at,
        devices_reporting: num_i64(devices).and_then(|d| u32::try_from(d).ok()).unwrap_or(0),
        reading,
    })
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn num_f64(v: Option<&Value>) -> Option<f64> {
    v.and_then(|x| x.as_f64().or_else(|| x.as_str().and_then(|s| s.trim().parse().ok())))
        .filter(|f| f.is_finite())
}

fn num_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    v.as_i64()
        .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}
