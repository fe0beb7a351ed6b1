mod api;
mod auth;
mod collector;
mod config;
mod cycle;
mod error;
mod fetcher;
mod normalizer;
mod scheduler;
mod sink;
mod types;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::auth::{FileTokenStore, HttpOAuthClient, TokenManager};
use crate::collector::TelemetryCollector;
use crate::config::{Config, SinkKind};
use crate::cycle::{CycleExecutor, CycleRunner};
use crate::error::{AppError, Result};
use crate::fetcher::EndpointFetcher;
use crate::scheduler::Scheduler;
use crate::sink::{BatchIngestSink, RetryPolicy, Sink, StreamSink};
use crate::types::{CycleOutcome, Trigger};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    info!(
        system_id = cfg.system_id,
        timezone = %cfg.timezone,
        sink = ?cfg.sink,
        "Starting telemetry bridge",
    );

    // --- Tokens ---
    let store = Arc::new(FileTokenStore::new(&cfg.token_file));
    let oauth = Arc::new(HttpOAuthClient::new(&cfg)?);
    let tokens = Arc::new(TokenManager::bootstrap(&cfg, oauth, store).await?);
    info!(expires_at = %tokens.current().await.expires_at, "Token manager ready");

    // --- Pipeline ---
    let fetcher = Arc::new(EndpointFetcher::new(&cfg, Arc::clone(&tokens))?);
    let collector = TelemetryCollector::new(fetcher);
    let sink = build_sink(&cfg).await?;
    let runner = Arc::new(CycleRunner::new(&cfg, collector, sink));

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    if cfg.run_once {
        let result = runner.execute(Trigger::Manual, cancel.child_token()).await;
        return match result.outcome() {
            CycleOutcome::Failure => Err(AppError::Delivery(format!(
                "single run failed ({} endpoints failed, delivery error: {})",
                result.failed_endpoints.len(),
                result.delivery_error.as_deref().unwrap_or("none"),
            ))),
            _ => Ok(()),
        };
    }

    // --- Scheduler ---
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new()?);
    let (scheduler, handle) = Scheduler::new(
        &cfg,
        runner,
        Arc::clone(&health),
        Arc::clone(&latency),
        cancel.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    // --- HTTP API ---
    let app = router(ApiState { health, latency, scheduler: handle });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    let api_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { api_cancel.cancelled().await })
        .await?;

    if let Err(e) = scheduler_task.await {
        error!("Scheduler task ended abnormally: {e}");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn build_sink(cfg: &Config) -> Result<Arc<dyn Sink>> {
    let policy = RetryPolicy::default();
    match cfg.sink {
        SinkKind::Batch => Ok(Arc::new(BatchIngestSink::connect(&cfg.db_path, policy).await?)),
        SinkKind::Stream => {
            let url = cfg
                .stream_url
                .clone()
                .ok_or_else(|| AppError::Config("SINK=stream requires STREAM_URL".to_string()))?;
            info!(url = %url, "Streaming records to {url}");
            Ok(Arc::new(StreamSink::new(url, cfg.stream_auth_header.clone(), policy)?))
        }
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                cancel.cancel();
            }
            Err(e) => error!("Could not listen for shutdown signal: {e}"),
        }
    });
}
