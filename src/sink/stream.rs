use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{deliver_with_retry, RetryPolicy, Sink};
use crate::config::HTTP_TIMEOUT_SECS;
use crate::error::{AppError, Result};
use crate::types::{DeliveryReport, UnifiedRecord};

/// Appends records to an HTTP streaming endpoint as discrete keyed messages.
///
/// Wire format, one POST per batch:
/// `{"records": [{"key": "<system_id>:<timestamp_utc>", "value": {..}}, ..]}`
pub struct StreamSink {
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    policy: RetryPolicy,
}

#[derive(Serialize)]
struct Envelope<'a> {
    records: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    key: String,
    value: &'a UnifiedRecord,
}

impl StreamSink {
    pub fn new(url: impl Into<String>, auth_header: Option<String>, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, url: url.into(), auth_header, policy })
    }

    async fn post(&self, body: &[u8]) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(auth) = &self.auth_header {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(AppError::HttpStatus {
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        })
    }
}

#[async_trait]
impl Sink for StreamSink {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn deliver(&self, records: &[UnifiedRecord]) -> DeliveryReport {
        if records.is_empty() {
            return DeliveryReport::default();
        }

        // Serialized once so every retry resends byte-identical messages.
        let envelope = Envelope {
            records: records
                .iter()
                .map(|r| Message { key: r.dedup_key(), value: r })
                .collect(),
        };
        let body = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                return DeliveryReport {
                    delivered_count: 0,
                    attempts: 0,
                    error: Some(AppError::Delivery(format!("stream: cannot encode batch: {e}"))),
                }
            }
        };

        deliver_with_retry(self.name(), &self.policy, records.len(), || self.post(&body)).await
    }
}
