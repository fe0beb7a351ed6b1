use chrono_tz::Tz;

use crate::error::{AppError, Result};

pub const ENPHASE_API_URL: &str = "https://api.enphaseenergy.com/api/v4";
pub const ENPHASE_TOKEN_URL: &str = "https://api.enphaseenergy.com/oauth/token";
pub const ENPHASE_REDIRECT_URI: &str = "https://api.enphaseenergy.com/oauth/redirect_uri";

/// Timezone used for `timestamp_local` when SYSTEM_TIMEZONE is unset.
pub const DEFAULT_TIMEZONE: &str = "Pacific/Honolulu";

/// A token is refreshed once it is this close to expiry.
pub const TOKEN_SAFETY_MARGIN_SECS: i64 = 60;

/// Lifetime assumed when the OAuth response omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Per-request timeout for every outbound HTTP call.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Per-endpoint retries after the first attempt, for transient fetch errors.
pub const FETCH_MAX_RETRIES: u32 = 2;
/// First fetch retry delay; doubles on each retry.
pub const FETCH_RETRY_BASE_MS: u64 = 500;

/// Sink delivery attempts (including the first).
pub const DELIVERY_MAX_ATTEMPTS: u32 = 5;
pub const DELIVERY_RETRY_BASE_MS: u64 = 1_000;
pub const DELIVERY_RETRY_MAX_MS: u64 = 30_000;

/// Rows per INSERT statement inside one ingestion transaction.
pub const BATCH_INSERT_CHUNK: usize = 200;

/// Upper bound on a single backfill request.
pub const MAX_BACKFILL_DAYS: u32 = 30;
/// Pause between backfilled days to stay under the provider rate limit.
pub const BACKFILL_DAY_PAUSE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Stream,
    Batch,
}

impl std::str::FromStr for SinkKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(SinkKind::Stream),
            "batch" => Ok(SinkKind::Batch),
            other => Err(AppError::Config(format!(
                "SINK must be 'stream' or 'batch', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub api_key: String,
    pub client_id: String,
    pub client_secret: String,
    pub system_id: u64,
    /// Seed refresh token, used only when the token file is empty (ENPHASE_REFRESH_TOKEN)
    pub refresh_token: Option<String>,
    /// One-time authorization code, exchanged when no refresh token exists (ENPHASE_AUTH_CODE)
    pub auth_code: Option<String>,
    pub token_file: String,
    pub timezone: Tz,
    /// Seconds between scheduled cycles (POLL_INTERVAL_SECS)
    pub poll_interval_secs: u64,
    /// Ceiling for the widened interval after auth failures (MAX_BACKOFF_SECS)
    pub max_backoff_secs: u64,
    /// Width of one provider reading bucket (INTERVAL_SECS)
    pub interval_secs: u64,
    pub granularity: String,
    /// How far back a scheduled cycle may reach (LOOKBACK_SECS)
    pub lookback_secs: i64,
    pub max_calls_per_minute: usize,
    pub sink: SinkKind,
    pub stream_url: Option<String>,
    /// Full Authorization header value for the stream endpoint (STREAM_AUTH_HEADER)
    pub stream_auth_header: Option<String>,
    pub db_path: String,
    pub api_port: u16,
    pub run_once: bool,
    pub run_on_startup: bool,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let missing: Vec<&str> = [
            "ENPHASE_API_KEY",
            "ENPHASE_CLIENT_ID",
            "ENPHASE_CLIENT_SECRET",
            "ENPHASE_SYSTEM_ID",
        ]
        .into_iter()
        .filter(|name| env_opt(name).is_none())
        .collect();
        if !missing.is_empty() {
            return Err(AppError::Config(format!(
                "missing required variables: {}",
                missing.join(", ")
            )));
        }

        let system_id = env_or("ENPHASE_SYSTEM_ID", "")
            .parse::<u64>()
            .map_err(|_| AppError::Config("ENPHASE_SYSTEM_ID must be a numeric id".to_string()))?;

        let tz_name = env_or("SYSTEM_TIMEZONE", DEFAULT_TIMEZONE);
        let timezone = tz_name
            .parse::<Tz>()
            .map_err(|_| AppError::Config(format!("SYSTEM_TIMEZONE '{tz_name}' is not an IANA zone")))?;

        let sink = env_or("SINK", "batch").parse::<SinkKind>()?;
        let stream_url = env_opt("STREAM_URL");
        if sink == SinkKind::Stream && stream_url.is_none() {
            return Err(AppError::Config("SINK=stream requires STREAM_URL".to_string()));
        }

        let interval_secs = env_or("INTERVAL_SECS", "900").parse::<u64>().unwrap_or(900);
        if interval_secs == 0 {
            return Err(AppError::Config("INTERVAL_SECS must be positive".to_string()));
        }

        let poll_interval_secs = env_or("POLL_INTERVAL_SECS", "14400")
            .parse::<u64>()
            .unwrap_or(14_400)
            .max(1);

        Ok(Self {
            api_url: env_or("ENPHASE_API_URL", ENPHASE_API_URL),
            token_url: env_or("ENPHASE_TOKEN_URL", ENPHASE_TOKEN_URL),
            redirect_uri: env_or("ENPHASE_REDIRECT_URI", ENPHASE_REDIRECT_URI),
            api_key: env_or("ENPHASE_API_KEY", ""),
            client_id: env_or("ENPHASE_CLIENT_ID", ""),
            client_secret: env_or("ENPHASE_CLIENT_SECRET", ""),
            system_id,
            refresh_token: env_opt("ENPHASE_REFRESH_TOKEN"),
            auth_code: env_opt("ENPHASE_AUTH_CODE"),
            token_file: env_or("TOKEN_FILE", ".tokens.json"),
            timezone,
            poll_interval_secs,
            max_backoff_secs: env_or("MAX_BACKOFF_SECS", "86400")
                .parse::<u64>()
                .unwrap_or(86_400)
                .max(poll_interval_secs),
            interval_secs,
            granularity: env_or("GRANULARITY", "week"),
            lookback_secs: parse_lookback(&env_or("LOOKBACK_SECS", "86400"))?,
            max_calls_per_minute: env_or("MAX_CALLS_PER_MINUTE", "10")
                .parse::<usize>()
                .unwrap_or(10)
                .max(1),
            sink,
            stream_url,
            stream_auth_header: env_opt("STREAM_AUTH_HEADER"),
            db_path: env_or("DB_PATH", "telemetry.db"),
            api_port: env_or("API_PORT", "3000")
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            run_once: env_flag("RUN_ONCE", false),
            run_on_startup: env_flag("RUN_ON_STARTUP", true),
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}

fn parse_lookback(raw: &str) -> Result<i64> {
    match raw.parse::<i64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(AppError::Config(format!(
            "LOOKBACK_SECS must be a positive number of seconds, got '{raw}'"
        ))),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_opt(name).as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
