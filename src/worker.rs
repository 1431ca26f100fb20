//! Worker pool.
//!
//! Durable pull consumer with bounded concurrency. Each message maps to
//! one pipeline execution; retriable failures nak with the configured
//! backoff, non-retriable ones (malformed payloads, exhausted deliveries)
//! go to the DLQ with a reason and are acked so they never redeliver.
//! Shutdown stops fetching and drains in-flight executions.

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use anyhow::{Context, Result};
use async_nats::jetstream::AckKind;
use async_nats::jetstream::consumer::PullConsumer;
use futures::StreamExt;
use prometheus::{Encoder, Histogram, IntCounter, Registry, TextEncoder};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::collectors::Providers;
use crate::config::Config;
use crate::index::Index;
use crate::llm::LlmClient;
use crate::model::{InvestigationJob, case_id};
use crate::pipeline::Pipeline;
use crate::queue::Queue;
use crate::store::{ArtifactStore, persist_with_retry};

/* ============================= PROMETHEUS ============================= */

static WORKER_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static INVESTIGATIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "tarka_investigations_completed_total",
        "Investigations that ran and persisted",
    )
    .expect("metric definition is valid");
    WORKER_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static INVESTIGATIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "tarka_investigations_failed_total",
        "Investigations that failed and were retried or dead-lettered",
    )
    .expect("metric definition is valid");
    WORKER_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static DLQ_PUBLISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("tarka_dlq_published_total", "Messages pushed to the DLQ")
        .expect("metric definition is valid");
    WORKER_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static PIPELINE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "tarka_pipeline_duration_seconds",
            "Wall-clock duration of pipeline executions",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 180.0]),
    )
    .expect("metric definition is valid");
    WORKER_REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub fn metrics_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&WORKER_REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/* ============================= WORKER ============================= */

pub struct Worker {
    pub config: Arc<Config>,
    pub queue: Arc<Queue>,
    pub providers: Arc<Providers>,
    pub store: Option<Arc<ArtifactStore>>,
    pub index: Option<Arc<Index>>,
    pub llm: Option<Arc<LlmClient>>,
}

impl Worker {
    /// Consume until ctrl-c. Fetching stops on shutdown; in-flight
    /// executions run to completion (or their ack-wait elapses and the
    /// messages redeliver, which HEAD-before-PUT makes harmless).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let consumer = self.queue.consumer().await.context("create durable consumer")?;
        let semaphore = Arc::new(Semaphore::new(self.config.worker.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            concurrency = self.config.worker.concurrency,
            fetch_batch = self.config.worker.fetch_batch,
            "worker_started"
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown_signal_received");
                    break;
                }
                fetched = fetch_batch(&consumer, self.config.worker.fetch_batch) => {
                    let messages = match fetched {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(error = %e, "worker_fetch_error");
                            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                            continue;
                        }
                    };
                    for message in messages {
                        let permit = semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("semaphore never closed");
                        let worker = self.clone();
                        in_flight.spawn(async move {
                            worker.handle_message(message).await;
                            drop(permit);
                        });
                    }
                    // Reap finished tasks so the set does not grow unbounded.
                    while in_flight.try_join_next().is_some() {}
                }
            }
        }

        info!(draining = in_flight.len(), "worker_draining");
        while in_flight.join_next().await.is_some() {}
        info!("worker_stopped");
        Ok(())
    }

    async fn handle_message(&self, message: async_nats::jetstream::Message) {
        let payload = message.payload.to_vec();

        let job: InvestigationJob = match serde_json::from_slice(&payload) {
            Ok(job) => job,
            Err(e) => {
                // Malformed payloads can never succeed; dead-letter now.
                warn!(error = %e, "job_payload_malformed");
                self.dead_letter(&message, &payload, &format!("malformed_job: {e}")).await;
                return;
            }
        };

        let started = Instant::now();
        let case = case_id(&job.identity, job.family);
        let recurrence = match &self.index {
            Some(index) => index.recurrence_24h(&case).await.unwrap_or(0),
            None => 0,
        };

        let pipeline = Pipeline {
            config: &self.config,
            providers: &self.providers,
            llm: self.llm.as_deref(),
        };
        let investigation = pipeline.investigate(&job, recurrence).await;
        PIPELINE_DURATION.observe(started.elapsed().as_secs_f64());

        // Stage 11: persist, then announce completion.
        if let Some(store) = &self.store {
            let persisted = persist_with_retry(
                store,
                self.index.as_deref(),
                &investigation,
                job.dedup_bucket,
                job.overwrite,
                crate::pipeline::Stage::Persist.cap(),
            )
            .await;

            match persisted {
                Ok((_, report_key)) => {
                    let event = crate::queue::CompletionEvent {
                        case_id: investigation.case_id.clone(),
                        run_id: investigation.run_id.clone(),
                        classification: investigation
                            .analysis
                            .scores
                            .classification
                            .as_str()
                            .to_string(),
                        report_key,
                    };
                    // Completion events are best-effort; the artifact and
                    // index row are already durable.
                    if let Err(e) = self.queue.publish_completion(&event).await {
                        warn!(error = %e, "completion_publish_failed");
                    }
                }
                Err(e) => {
                    INVESTIGATIONS_FAILED.inc();
                    self.retry_or_dead_letter(
                        &message,
                        &payload,
                        &format!("artifact_write_failed: {e}"),
                    )
                    .await;
                    return;
                }
            }
        }

        INVESTIGATIONS_COMPLETED.inc();
        if let Err(e) = message.ack().await {
            warn!(error = %e, "ack_failed");
        }
    }

    /// Retriable failure: nak with the configured backoff unless this was
    /// the final allowed delivery, in which case dead-letter.
    async fn retry_or_dead_letter(
        &self,
        message: &async_nats::jetstream::Message,
        payload: &[u8],
        reason: &str,
    ) {
        let delivered = message.info().map(|i| i.delivered).unwrap_or(1);
        if delivered >= self.queue.max_deliver() {
            error!(delivered, reason, "job_exhausted_deliveries");
            self.dead_letter(message, payload, reason).await;
            return;
        }

        let delay = self.queue.backoff_delay(delivered);
        warn!(delivered, delay_secs = delay.as_secs(), reason, "job_nak_for_retry");
        if let Err(e) = message.ack_with(AckKind::Nak(Some(delay))).await {
            warn!(error = %e, "nak_failed");
        }
    }

    async fn dead_letter(
        &self,
        message: &async_nats::jetstream::Message,
        payload: &[u8],
        reason: &str,
    ) {
        if let Err(e) = self.queue.publish_dlq(payload, reason).await {
            // DLQ publish failed; leave the message unacked so it
            // redelivers rather than vanishing.
            error!(error = %e, "dlq_publish_failed");
            return;
        }
        DLQ_PUBLISHED.inc();
        if let Err(e) = message.ack().await {
            warn!(error = %e, "dlq_ack_failed");
        }
    }
}

async fn fetch_batch(
    consumer: &PullConsumer,
    batch: usize,
) -> Result<Vec<async_nats::jetstream::Message>> {
    let mut stream = consumer
        .fetch()
        .max_messages(batch)
        .expires(std::time::Duration::from_secs(5))
        .messages()
        .await
        .map_err(|e| anyhow::anyhow!("fetch: {e}"))?;

    let mut messages = Vec::new();
    while let Some(next) = stream.next().await {
        match next {
            Ok(message) => messages.push(message),
            Err(e) => return Err(anyhow::anyhow!("fetch stream: {e}")),
        }
    }
    Ok(messages)
}
