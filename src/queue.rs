//! Durable queue plumbing on NATS JetStream.
//!
//! One stream carries investigation jobs; publish-time message ids keyed
//! on (identity, family, dedup bucket) let the stream's duplicate window
//! suppress re-publishes of the same logical incident. A second stream
//! receives dead letters with the failure reason attached as a header.

use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, stream};
use async_nats::header::{HeaderMap, HeaderName};
use tracing::info;

use crate::config::QueueConfig;
use crate::model::InvestigationJob;

pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";
pub const HEADER_DLQ_REASON: &str = "Tarka-Failure-Reason";

/// Published after a run persists.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompletionEvent {
    pub case_id: String,
    pub run_id: String,
    pub classification: String,
    pub report_key: String,
}

pub struct Queue {
    jetstream: jetstream::Context,
    config: QueueConfig,
}

impl Queue {
    pub async fn connect(config: &QueueConfig) -> Result<Queue> {
        let client = async_nats::connect(config.nats_url.as_str())
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", config.nats_url))?;
        Ok(Queue {
            jetstream: jetstream::new(client),
            config: config.clone(),
        })
    }

    /// Create (or adopt) the job stream and the DLQ stream.
    pub async fn ensure_streams(&self) -> Result<()> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: self.config.stream.clone(),
                subjects: vec![
                    self.config.subject.clone(),
                    self.config.completions_subject.clone(),
                ],
                duplicate_window: self.config.duplicate_window,
                max_messages: 100_000,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("create stream {}: {e}", self.config.stream))?;

        self.jetstream
            .get_or_create_stream(stream::Config {
                name: self.config.dlq_stream.clone(),
                subjects: vec![self.config.dlq_subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("create stream {}: {e}", self.config.dlq_stream))?;

        info!(
            stream = %self.config.stream,
            dlq = %self.config.dlq_stream,
            "jetstream_streams_ready"
        );
        Ok(())
    }

    /// Publish one job. The message id makes publishes within the
    /// duplicate window idempotent, so the caller may safely retry.
    pub async fn publish_job(&self, job: &InvestigationJob) -> Result<()> {
        let payload = serde_json::to_vec(job).context("serialize job")?;
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_MSG_ID.parse::<HeaderName>().expect("static header name"),
            job.dedup_key().as_str(),
        );

        self.jetstream
            .publish_with_headers(self.config.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| anyhow::anyhow!("queue_publish_failed: {e}"))?
            .await
            .map_err(|e| anyhow::anyhow!("queue_publish_failed: {e}"))?;
        Ok(())
    }

    /// Durable pull consumer with the configured ack-wait, delivery cap,
    /// and backoff schedule.
    pub async fn consumer(&self) -> Result<PullConsumer> {
        let stream = self
            .jetstream
            .get_stream(self.config.stream.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("get stream {}: {e}", self.config.stream))?;

        stream
            .get_or_create_consumer(
                &self.config.durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(self.config.durable.clone()),
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    backoff: self.config.backoff.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("create consumer {}: {e}", self.config.durable))
    }

    /// Announce a finished run so downstream consumers (console, chat)
    /// can refresh without polling the index.
    pub async fn publish_completion(&self, event: &CompletionEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("serialize completion")?;
        self.jetstream
            .publish(self.config.completions_subject.clone(), payload.into())
            .await
            .map_err(|e| anyhow::anyhow!("completion_publish_failed: {e}"))?
            .await
            .map_err(|e| anyhow::anyhow!("completion_publish_failed: {e}"))?;
        Ok(())
    }

    /// Push a permanently-failed message to the DLQ with its reason.
    pub async fn publish_dlq(&self, payload: &[u8], reason: &str) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_DLQ_REASON.parse::<HeaderName>().expect("static header name"),
            reason,
        );
        self.jetstream
            .publish_with_headers(
                self.config.dlq_subject.clone(),
                headers,
                payload.to_vec().into(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("dlq_publish_failed: {e}"))?
            .await
            .map_err(|e| anyhow::anyhow!("dlq_publish_failed: {e}"))?;
        Ok(())
    }

    pub fn backoff_delay(&self, delivery: i64) -> Duration {
        backoff_delay_from(&self.config.backoff, delivery)
    }

    pub fn max_deliver(&self) -> i64 {
        self.config.max_deliver
    }
}

/// Delay before the next delivery attempt: the schedule entry for this
/// delivery count, clamped to the last entry.
pub fn backoff_delay_from(schedule: &[Duration], delivery: i64) -> Duration {
    if schedule.is_empty() {
        return Duration::from_secs(5);
    }
    let idx = (delivery.max(1) as usize - 1).min(schedule.len() - 1);
    schedule[idx]
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            nats_url: "nats://localhost:4222".into(),
            stream: "TARKA".into(),
            subject: "tarka.alerts".into(),
            durable: "tarka-worker".into(),
            ack_wait: Duration::from_secs(300),
            max_deliver: 4,
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(120),
            ],
            dlq_stream: "TARKA_DLQ".into(),
            dlq_subject: "tarka.dlq".into(),
            completions_subject: "tarka.completions".into(),
            duplicate_window: Duration::from_secs(120),
        }
    }

    #[test]
    fn test_backoff_delay_follows_schedule() {
        let config = config();
        assert_eq!(backoff_delay_from(&config.backoff, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay_from(&config.backoff, 2), Duration::from_secs(30));
        assert_eq!(backoff_delay_from(&config.backoff, 3), Duration::from_secs(120));
        assert_eq!(
            backoff_delay_from(&config.backoff, 9),
            Duration::from_secs(120),
            "clamps to last entry"
        );
        assert_eq!(backoff_delay_from(&[], 1), Duration::from_secs(5));
    }
}
