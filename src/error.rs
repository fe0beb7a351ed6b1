use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Token refresh or exchange failed. Fatal for the cycle.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Remote endpoint answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed payload. Fatal for the endpoint only.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sink rejected the batch after retries.
    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Operation timed out")]
    Timeout,

    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    /// Operator API request that cannot be honoured as given.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::HttpStatus { status, .. } => is_transient_status(*status),
            AppError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| is_transient_status(s.as_u16())).unwrap_or(false)
            }
            AppError::Timeout => true,
            AppError::Database(e) => is_transient_db_error(e),
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::Auth(_))
    }
}

/// 5xx, throttling (429) and request timeout (408) are retryable.
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

fn is_transient_db_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::BAD_GATEWAY,
            AppError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [500, 502, 503, 504, 429, 408] {
            let e = AppError::HttpStatus { status, body: String::new() };
            assert!(e.is_transient(), "status {status} should be transient");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 422] {
            let e = AppError::HttpStatus { status, body: String::new() };
            assert!(!e.is_transient(), "status {status} should not be transient");
        }
        assert!(!AppError::Auth("revoked".into()).is_transient());
        assert!(!AppError::Parse("bad body".into()).is_transient());
        assert!(AppError::Timeout.is_transient());
    }

    #[test]
    fn pool_exhaustion_and_io_are_transient_db_errors() {
        assert!(is_transient_db_error(&sqlx::Error::PoolTimedOut));
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk hiccup");
        assert!(AppError::Database(sqlx::Error::Io(io)).is_transient());

        assert!(!is_transient_db_error(&sqlx::Error::RowNotFound));
        assert!(!is_transient_db_error(&sqlx::Error::PoolClosed));
        assert!(!AppError::Database(sqlx::Error::ColumnNotFound("x".into())).is_transient());
    }
}
