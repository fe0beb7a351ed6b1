use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Telemetry types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryType {
    Production,
    Consumption,
    Battery,
    Import,
    Export,
}

impl TelemetryType {
    pub const ALL: [TelemetryType; 5] = [
        TelemetryType::Production,
        TelemetryType::Consumption,
        TelemetryType::Battery,
        TelemetryType::Import,
        TelemetryType::Export,
    ];
}

impl std::fmt::Display for TelemetryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TelemetryType::Production => "production",
            TelemetryType::Consumption => "consumption",
            TelemetryType::Battery => "battery",
            TelemetryType::Import => "import",
            TelemetryType::Export => "export",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// OAuth tokens
// ---------------------------------------------------------------------------

/// Access/refresh token pair. `expires_at` is always meaningful when
/// `access_token` is non-empty; a seed pair with an empty access token is
/// stamped at the epoch so it reads as expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenPair {
    /// Pair holding only a refresh token, forcing a refresh on first use.
    pub fn seed(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            expires_at: DateTime::<Utc>::default(),
        }
    }

    /// True if the access token stays valid for at least `margin` past `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        !self.access_token.is_empty() && self.expires_at > now + margin
    }
}

// ---------------------------------------------------------------------------
// Fetch inputs
// ---------------------------------------------------------------------------

/// Closed time range in UTC epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_at: i64,
    pub end_at: i64,
}

impl TimeWindow {
    pub fn new(start_at: i64, end_at: i64) -> Self {
        Self { start_at, end_at }
    }
}

/// How an endpoint lays out its `intervals` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `"intervals": [{..}, {..}]`
    Flat,
    /// `"intervals": [[{..}, {..}], [..]]`
    Nested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub telemetry_type: TelemetryType,
    /// Path below `systems/{system_id}/`.
    pub path: &'static str,
    pub shape: ResponseShape,
}

impl EndpointSpec {
    /// The full provider catalogue, one endpoint per telemetry type.
    pub fn catalogue() -> Vec<EndpointSpec> {
        TelemetryType::ALL.iter().map(|t| Self::for_type(*t)).collect()
    }

    pub fn for_type(telemetry_type: TelemetryType) -> Self {
        let (path, shape) = match telemetry_type {
            TelemetryType::Production => ("telemetry/production_meter", ResponseShape::Flat),
            TelemetryType::Consumption => ("telemetry/consumption_meter", ResponseShape::Flat),
            TelemetryType::Battery => ("telemetry/battery", ResponseShape::Flat),
            TelemetryType::Import => ("energy_import_telemetry", ResponseShape::Nested),
            TelemetryType::Export => ("energy_export_telemetry", ResponseShape::Nested),
        };
        Self { telemetry_type, path, shape }
    }
}

// ---------------------------------------------------------------------------
// Raw payloads
// ---------------------------------------------------------------------------

/// Value fields of one interval, tagged by telemetry type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Production { wh_del: Option<f64> },
    Consumption { wh_used: Option<f64> },
    Battery {
        charge_wh: Option<f64>,
        discharge_wh: Option<f64>,
        soc_percent: Option<f64>,
    },
    Import { wh_imported: Option<f64> },
    Export { wh_exported: Option<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalReading {
    /// UTC epoch seconds at the end of the interval.
    pub end_at: i64,
    pub devices_reporting: u32,
    pub reading: Reading,
}

/// One endpoint's decoded response, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub telemetry_type: TelemetryType,
    pub intervals: Vec<IntervalReading>,
}

// ---------------------------------------------------------------------------
// Unified output
// ---------------------------------------------------------------------------

/// Canonical output row. `None` means the cycle had no reading for the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub timestamp_utc: i64,
    pub timestamp_local: DateTime<FixedOffset>,
    pub production_wh: Option<f64>,
    pub production_w: Option<f64>,
    pub consumption_wh: Option<f64>,
    pub consumption_w: Option<f64>,
    pub battery_percent: Option<f64>,
    pub battery_power_w: Option<f64>,
    pub grid_import_wh: Option<f64>,
    pub grid_export_wh: Option<f64>,
    pub system_id: u64,
}

impl UnifiedRecord {
    /// Key downstream consumers deduplicate on.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.system_id, self.timestamp_utc)
    }
}

#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered_count: usize,
    pub attempts: u32,
    pub error: Option<crate::error::AppError>,
}

// ---------------------------------------------------------------------------
// Cycle results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Success,
    Partial,
    Failure,
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::Success => write!(f, "success"),
            CycleOutcome::Partial => write!(f, "partial"),
            CycleOutcome::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub window: TimeWindow,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempted_endpoints: BTreeSet<TelemetryType>,
    pub succeeded_endpoints: BTreeSet<TelemetryType>,
    /// Error text per failed endpoint.
    pub failed_endpoints: BTreeMap<TelemetryType, String>,
    /// Set when any endpoint failed on token acquisition.
    pub auth_failed: bool,
    pub records_delivered: usize,
    pub delivery_error: Option<String>,
    pub cancelled: bool,
}

impl CycleResult {
    pub fn new(window: TimeWindow, started_at: DateTime<Utc>) -> Self {
        Self {
            window,
            started_at,
            duration_ms: 0,
            attempted_endpoints: BTreeSet::new(),
            succeeded_endpoints: BTreeSet::new(),
            failed_endpoints: BTreeMap::new(),
            auth_failed: false,
            records_delivered: 0,
            delivery_error: None,
            cancelled: false,
        }
    }

    pub fn outcome(&self) -> CycleOutcome {
        if self.cancelled
            || self.auth_failed
            || self.delivery_error.is_some()
            || (!self.attempted_endpoints.is_empty() && self.succeeded_endpoints.is_empty())
        {
            CycleOutcome::Failure
        } else if self.failed_endpoints.is_empty() {
            CycleOutcome::Success
        } else {
            CycleOutcome::Partial
        }
    }

    /// Fold a later pass (one backfilled day) into this aggregate.
    pub fn absorb(&mut self, other: CycleResult) {
        self.window.start_at = self.window.start_at.min(other.window.start_at);
        self.window.end_at = self.window.end_at.max(other.window.end_at);
        self.attempted_endpoints.extend(other.attempted_endpoints);
        self.succeeded_endpoints.extend(other.succeeded_endpoints);
        self.failed_endpoints.extend(other.failed_endpoints);
        self.auth_failed |= other.auth_failed;
        self.records_delivered += other.records_delivered;
        if other.delivery_error.is_some() {
            self.delivery_error = other.delivery_error;
        }
        self.cancelled |= other.cancelled;
    }
}

/// What set a cycle in motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Timer,
    Manual,
    Backfill { days: u32 },
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Timer => write!(f, "timer"),
            Trigger::Manual => write!(f, "manual"),
            Trigger::Backfill { days } => write!(f, "backfill({days}d)"),
        }
    }
}
