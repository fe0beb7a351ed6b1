//! Shared fixtures for unit tests.

use axum::Router;

use crate::config::{Config, SinkKind};

/// A complete config pointing at nothing; tests override what they exercise.
pub fn config() -> Config {
    Config {
        api_url: "http://127.0.0.1:9/api/v4".to_string(),
        token_url: "http://127.0.0.1:9/oauth/token".to_string(),
        redirect_uri: "http://127.0.0.1:9/oauth/redirect_uri".to_string(),
        api_key: "test-key".to_string(),
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        system_id: 42,
        refresh_token: Some("env-rt".to_string()),
        auth_code: None,
        token_file: ".tokens.test.json".to_string(),
        timezone: chrono_tz::America::Los_Angeles,
        poll_interval_secs: 3_600,
        max_backoff_secs: 86_400,
        interval_secs: 900,
        granularity: "day".to_string(),
        lookback_secs: 86_400,
        max_calls_per_minute: 100,
        sink: SinkKind::Batch,
        stream_url: None,
        stream_auth_header: None,
        db_path: ":memory:".to_string(),
        api_port: 0,
        run_once: false,
        run_on_startup: false,
        log_level: "debug".to_string(),
    }
}

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
