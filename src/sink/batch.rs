use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use super::{deliver_with_retry, RetryPolicy, Sink};
use crate::config::BATCH_INSERT_CHUNK;
use crate::error::Result;
use crate::types::{DeliveryReport, UnifiedRecord};

/// SQLite-backed ingestion store. One `deliver` is one transaction; rows are
/// upserted on `(system_id, timestamp_utc)` so overlapping cycles fill in
/// rather than duplicate.
pub struct BatchIngestSink {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl BatchIngestSink {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Open (creating if needed) the database file and apply migrations.
    pub async fn connect(db_path: &str, policy: RetryPolicy) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
        migrate(&pool).await?;
        info!("Database ready at {db_path}");
        Ok(Self::new(pool, policy))
    }

    async fn ingest(&self, records: &[UnifiedRecord]) -> Result<()> {
        let ingested_at = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(BATCH_INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO solar_telemetry (
                    system_id, timestamp_utc, timestamp_local,
                    production_wh, production_w, consumption_wh, consumption_w,
                    battery_percent, battery_power_w, grid_import_wh, grid_export_wh,
                    ingested_at
                ) ",
            );
            qb.push_values(chunk, |mut row, r| {
                row.push_bind(r.system_id as i64)
                    .push_bind(r.timestamp_utc)
                    .push_bind(r.timestamp_local.to_rfc3339())
                    .push_bind(r.production_wh)
                    .push_bind(r.production_w)
                    .push_bind(r.consumption_wh)
                    .push_bind(r.consumption_w)
                    .push_bind(r.battery_percent)
                    .push_bind(r.battery_power_w)
                    .push_bind(r.grid_import_wh)
                    .push_bind(r.grid_export_wh)
                    .push_bind(ingested_at);
            });
            // A missing reading in a re-delivered interval is "no value", not
            // a deletion: keep what is already stored.
            qb.push(
                " ON CONFLICT (system_id, timestamp_utc) DO UPDATE SET
                    timestamp_local = excluded.timestamp_local,
                    production_wh = COALESCE(excluded.production_wh, solar_telemetry.production_wh),
                    production_w = COALESCE(excluded.production_w, solar_telemetry.production_w),
                    consumption_wh = COALESCE(excluded.consumption_wh, solar_telemetry.consumption_wh),
                    consumption_w = COALESCE(excluded.consumption_w, solar_telemetry.consumption_w),
                    battery_percent = COALESCE(excluded.battery_percent, solar_telemetry.battery_percent),
                    battery_power_w = COALESCE(excluded.battery_power_w, solar_telemetry.battery_power_w),
                    grid_import_wh = COALESCE(excluded.grid_import_wh, solar_telemetry.grid_import_wh),
                    grid_export_wh = COALESCE(excluded.grid_export_wh, solar_telemetry.grid_export_wh),
                    ingested_at = excluded.ingested_at",
            );
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[async_trait]
impl Sink for BatchIngestSink {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn deliver(&self, records: &[UnifiedRecord]) -> DeliveryReport {
        if records.is_empty() {
            return DeliveryReport::default();
        }
        deliver_with_retry(self.name(), &self.policy, records.len(), || self.ingest(records)).await
    }

    async fn latest_timestamp(&self, system_id: u64) -> Result<Option<i64>> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(timestamp_utc) FROM solar_telemetry WHERE system_id = ?")
                .bind(system_id as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::error::AppError;

    async fn memory_sink() -> BatchIngestSink {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        let policy = RetryPolicy { max_attempts: 3, base: Duration::from_millis(1), max_delay: Duration::from_millis(2) };
        BatchIngestSink::new(pool, policy)
    }

    fn record(system_id: u64, ts: i64, production_wh: Option<f64>) -> UnifiedRecord {
        UnifiedRecord {
            timestamp_utc: ts,
            timestamp_local: chrono::FixedOffset::west_opt(10 * 3600)
                .unwrap()
                .timestamp_opt(ts, 0)
                .unwrap(),
            production_wh,
            production_w: production_wh.map(|wh| wh * 4.0),
            consumption_wh: None,
            consumption_w: None,
            battery_percent: Some(55.0),
            battery_power_w: None,
            grid_import_wh: None,
            grid_export_wh: None,
            system_id,
        }
    }

    async fn rows(sink: &BatchIngestSink) -> Vec<(i64, Option<f64>)> {
        sqlx::query_as("SELECT timestamp_utc, production_wh FROM solar_telemetry ORDER BY timestamp_utc")
            .fetch_all(&sink.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn delivers_batch_larger_than_one_chunk_in_one_transaction() {
        let sink = memory_sink().await;
        let batch: Vec<_> = (1..=(BATCH_INSERT_CHUNK as i64 + 50))
            .map(|i| record(42, i * 900, Some(i as f64)))
            .collect();

        let report = sink.deliver(&batch).await;

        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.delivered_count, batch.len());
        assert_eq!(report.attempts, 1);
        assert_eq!(rows(&sink).await.len(), batch.len());
    }

    #[tokio::test]
    async fn redelivered_interval_overwrites_instead_of_duplicating() {
        let sink = memory_sink().await;
        sink.deliver(&[record(42, 900, Some(1.0)), record(42, 1800, None)]).await;
        sink.deliver(&[record(42, 1800, Some(7.0)), record(42, 2700, Some(3.0))]).await;

        assert_eq!(rows(&sink).await, vec![(900, Some(1.0)), (1800, Some(7.0)), (2700, Some(3.0))]);
    }

    #[tokio::test]
    async fn partial_redelivery_keeps_stored_values() {
        let sink = memory_sink().await;
        let mut full = record(42, 900, Some(5.0));
        full.grid_export_wh = Some(12.0);
        sink.deliver(&[full]).await;

        // Export endpoint failed on the later cycle; production was revised.
        let partial = record(42, 900, Some(6.0));
        let report = sink.deliver(&[partial]).await;
        assert!(report.error.is_none(), "{:?}", report.error);

        let (production, export): (Option<f64>, Option<f64>) = sqlx::query_as(
            "SELECT production_wh, grid_export_wh FROM solar_telemetry WHERE system_id = 42 AND timestamp_utc = 900",
        )
        .fetch_one(&sink.pool)
        .await
        .unwrap();
        assert_eq!(production, Some(6.0));
        assert_eq!(export, Some(12.0));
    }

    #[tokio::test]
    async fn locked_database_is_retried_until_the_lock_clears() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("telemetry.db").display());

        let holder_opts = SqliteConnectOptions::from_str(&url).unwrap().create_if_missing(true);
        let holder = SqlitePoolOptions::new().max_connections(1).connect_with(holder_opts).await.unwrap();
        migrate(&holder).await.unwrap();

        // No busy wait on the sink side, so the held lock surfaces as an error.
        let sink_opts = SqliteConnectOptions::from_str(&url).unwrap().busy_timeout(Duration::ZERO);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(sink_opts).await.unwrap();
        let policy = RetryPolicy { max_attempts: 6, base: Duration::from_millis(20), max_delay: Duration::from_millis(200) };
        let sink = BatchIngestSink::new(pool, policy);

        let mut lock = holder.begin().await.unwrap();
        sqlx::query("INSERT INTO solar_telemetry (system_id, timestamp_utc, timestamp_local, ingested_at) VALUES (1, 1, '', 0)")
            .execute(&mut *lock)
            .await
            .unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            lock.commit().await.unwrap();
        });

        let report = sink.deliver(&[record(42, 900, Some(1.0))]).await;
        release.await.unwrap();

        assert!(report.error.is_none(), "{:?}", report.error);
        assert!(report.attempts > 1, "attempts = {}", report.attempts);
        assert_eq!(report.delivered_count, 1);
        assert_eq!(sink.latest_timestamp(42).await.unwrap(), Some(900));
    }

    #[tokio::test]
    async fn latest_timestamp_is_per_system() {
        let sink = memory_sink().await;
        assert_eq!(sink.latest_timestamp(42).await.unwrap(), None);

        sink.deliver(&[record(42, 900, None), record(42, 2700, None), record(7, 9000, None)]).await;

        assert_eq!(sink.latest_timestamp(42).await.unwrap(), Some(2700));
        assert_eq!(sink.latest_timestamp(7).await.unwrap(), Some(9000));
    }

    #[tokio::test]
    async fn schema_failure_is_permanent() {
        let sink = memory_sink().await;
        sqlx::query("DROP TABLE solar_telemetry").execute(&sink.pool).await.unwrap();

        let report = sink.deliver(&[record(42, 900, None)]).await;

        assert_eq!(report.attempts, 1);
        assert_eq!(report.delivered_count, 0);
        assert!(matches!(report.error, Some(AppError::Delivery(_))));
    }
}
