//! Artifact store (S3-compatible).
//!
//! Object keys follow the contract the console pre-computes:
//! `<prefix>/<yyyy-mm-dd>/<identity_hash>-<family>-<bucket>.{md,json}`.
//! Writes are HEAD-before-PUT: an object younger than the freshness
//! window is left alone unless the freshness gate marked the run for
//! overwrite. Redelivered jobs therefore change at most one object.

use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;
use crate::index::Index;
use crate::model::{FRESHNESS_WINDOW, Investigation};

/* ============================= KEYS ============================= */

/// Markdown and JSON twin keys for one run.
pub fn object_keys(
    prefix: &str,
    created_at: DateTime<Utc>,
    identity_hash: &str,
    family: &str,
    dedup_bucket: i64,
) -> (String, String) {
    let date = created_at.format("%Y-%m-%d");
    let stem = format!("{prefix}/{date}/{identity_hash}-{family}-{dedup_bucket}");
    (format!("{stem}.md"), format!("{stem}.json"))
}

/* ============================= STORE ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Written,
    SkippedFresh,
}

pub struct ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl ArtifactStore {
    pub async fn connect(config: &Config) -> Result<ArtifactStore> {
        let bucket = config
            .s3_bucket
            .clone()
            .context("S3_BUCKET is not configured")?;

        let base = aws_config::load_from_env().await;
        let client = match &config.s3_endpoint_url {
            Some(endpoint) => {
                let conf = aws_sdk_s3::config::Builder::from(&base)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build();
                aws_sdk_s3::Client::from_conf(conf)
            }
            None => aws_sdk_s3::Client::new(&base),
        };

        Ok(ArtifactStore {
            client,
            bucket,
            prefix: config.s3_prefix.clone(),
        })
    }

    /// Last-modified time of an object, or None when it does not exist.
    async fn head(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(out
                .last_modified()
                .and_then(|t| DateTime::from_timestamp(t.secs(), 0))),
            Err(err) => {
                let service = err.as_service_error();
                if service.is_some_and(|e| e.is_not_found()) {
                    Ok(None)
                } else {
                    Err(anyhow::anyhow!("head {key}: {err}"))
                }
            }
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        run_id: &str,
        case_id: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .metadata("x-run-id", run_id)
            .metadata("x-case-id", case_id)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("artifact_write_failed: put {key}: {e}"))?;
        Ok(())
    }

    /// Write both artifacts for a run, HEAD-first. `overwrite` comes from
    /// the freshness gate and forces the write even for fresh objects.
    pub async fn persist(
        &self,
        investigation: &Investigation,
        dedup_bucket: i64,
        overwrite: bool,
    ) -> Result<(PersistOutcome, String)> {
        let (md_key, json_key) = object_keys(
            &self.prefix,
            investigation.created_at,
            &investigation.identity.hash(),
            investigation.family.as_str(),
            dedup_bucket,
        );

        if !overwrite {
            if let Some(modified) = self.head(&md_key).await? {
                let age = investigation.created_at.signed_duration_since(modified);
                if age
                    < chrono::Duration::from_std(FRESHNESS_WINDOW)
                        .unwrap_or_else(|_| chrono::Duration::hours(1))
                {
                    info!(key = %md_key, "artifact_fresh_skipping");
                    return Ok((PersistOutcome::SkippedFresh, md_key));
                }
            }
        }

        self.put(
            &md_key,
            investigation.report_markdown.clone().into_bytes(),
            "text/markdown",
            &investigation.run_id,
            &investigation.case_id,
        )
        .await?;
        self.put(
            &json_key,
            serde_json::to_vec_pretty(&investigation.report_json)
                .context("serialize report json")?,
            "application/json",
            &investigation.run_id,
            &investigation.case_id,
        )
        .await?;

        info!(key = %md_key, "artifact_written");
        Ok((PersistOutcome::Written, md_key))
    }
}

/* ============================= STAGE 11 ============================= */

/// Persist stage: artifact write plus index upsert, retried with
/// exponential backoff inside the stage budget. A final failure surfaces
/// as an error so the worker can nak the job for redelivery.
pub async fn persist_with_retry(
    store: &ArtifactStore,
    index: Option<&Index>,
    investigation: &Investigation,
    dedup_bucket: i64,
    overwrite: bool,
    budget: Duration,
) -> Result<(PersistOutcome, String)> {
    let started = std::time::Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match store.persist(investigation, dedup_bucket, overwrite).await {
            Ok((outcome, report_key)) => {
                if let Some(index) = index {
                    index
                        .upsert_investigation(investigation, &report_key)
                        .await
                        .context("index upsert")?;
                }
                return Ok((outcome, report_key));
            }
            Err(e) => {
                let delay = Duration::from_secs(1 << attempt.min(4));
                if started.elapsed() + delay >= budget {
                    return Err(e.context("persist stage exhausted its budget"));
                }
                warn!(attempt, error = %e, "artifact_write_retrying");
                sleep(delay).await;
            }
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_object_key_schema() {
        let created = Utc.with_ymd_and_hms(2026, 7, 1, 12, 30, 0).unwrap();
        let (md, json) = object_keys("tarka", created, "abc123def456", "oom_killed", 123456);
        assert_eq!(md, "tarka/2026-07-01/abc123def456-oom_killed-123456.md");
        assert_eq!(json, "tarka/2026-07-01/abc123def456-oom_killed-123456.json");
    }

    #[test]
    fn test_object_keys_twin_apart_from_extension() {
        let created = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let (md, json) = object_keys("p", created, "h", "generic", 1);
        assert_eq!(md.strip_suffix(".md"), json.strip_suffix(".json"));
    }
}
