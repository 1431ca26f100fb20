//! Webhook ingestion.
//!
//! Accepts Alertmanager v4 payloads, filters them through the allowlist
//! and the rollout-noisy freshness gate, and publishes at most one durable
//! job per logical incident. The handler never partially enqueues on a
//! parse error and answers 202 without waiting for any investigation.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collectors::prefix_of;
use crate::config::Config;
use crate::index::Index;
use crate::model::{
    AlertInstance, AlertStatus, FRESHNESS_WINDOW, Family, Identity, InvestigationJob, TimeWindow,
    case_id, dedup_bucket, is_rollout_noisy,
};
use crate::queue::Queue;

/* ============================= PROMETHEUS ============================= */

static INGEST_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static ALERTS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("tarka_alerts_received_total", "Alerts received on the webhook")
        .expect("metric definition is valid");
    INGEST_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static ALERTS_ENQUEUED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("tarka_alerts_enqueued_total", "Jobs published to the queue")
        .expect("metric definition is valid");
    INGEST_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static SKIPPED_ALLOWLIST: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "tarka_alerts_skipped_allowlist_total",
        "Alerts dropped by the alertname allowlist",
    )
    .expect("metric definition is valid");
    INGEST_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static SKIPPED_FRESHNESS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "tarka_alerts_skipped_freshness_total",
        "Rollout-noisy alerts suppressed by the freshness gate",
    )
    .expect("metric definition is valid");
    INGEST_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= WIRE TYPES ============================= */

/// Alertmanager webhook payload (v4 shape). Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct AlertmanagerPayload {
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "groupKey")]
    pub group_key: String,
    pub alerts: Vec<AmAlert>,
}

#[derive(Debug, Deserialize)]
pub struct AmAlert {
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(default, rename = "endsAt")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fingerprint: String,
}

/// Convert one webhook alert into the immutable model form.
/// Fails (400 for the whole payload) when the alertname label is absent.
pub fn to_alert_instance(am: &AmAlert) -> Result<AlertInstance, String> {
    let alertname = am
        .labels
        .get("alertname")
        .cloned()
        .ok_or_else(|| "alert without an alertname label".to_string())?;
    // Alertmanager encodes "still firing" as a zero endsAt.
    let ends_at = am.ends_at.filter(|t| t.timestamp() > 0);
    Ok(AlertInstance {
        fingerprint: am.fingerprint.clone(),
        alertname,
        labels: am.labels.clone(),
        annotations: am.annotations.clone(),
        starts_at: am.starts_at,
        ends_at,
        status: if am.status == "resolved" {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        },
    })
}

/* ============================= GATES ============================= */

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Enqueue(Box<InvestigationJob>),
    SkipResolved,
    SkipAllowlist,
}

/// Pure part of ingestion: resolved filter, allowlist, identity/family
/// derivation, and the queue dedup key inputs. The freshness gate needs
/// the index and runs separately.
pub fn evaluate_alert(config: &Config, alert: AlertInstance, now: DateTime<Utc>) -> GateDecision {
    if alert.status == AlertStatus::Resolved {
        return GateDecision::SkipResolved;
    }

    if !config.alertname_allowlist.is_empty()
        && !config.alertname_allowlist.iter().any(|a| a == &alert.alertname)
    {
        return GateDecision::SkipAllowlist;
    }

    let mut identity = Identity::from_alert(&alert, &config.cluster_name);
    // Rollout-noisy alerts collapse to the owning workload. Ingestion uses
    // the pod-name heuristic; the pipeline re-resolves through
    // ownerReferences when the pod is still visible.
    if is_rollout_noisy(&alert.alertname, &config.rollout_noisy_extra) {
        if let Identity::Pod { cluster, namespace, pod } = &identity {
            identity = Identity::Workload {
                cluster: cluster.clone(),
                namespace: namespace.clone(),
                kind: "Deployment".to_string(),
                owner: prefix_of(pod).to_string(),
            };
        }
    }

    let family = Family::infer(&alert);
    let window = TimeWindow::ending_at(alert.starts_at, config.time_window);

    GateDecision::Enqueue(Box::new(InvestigationJob {
        identity,
        family,
        alert,
        window,
        dedup_bucket: dedup_bucket(now),
        overwrite: false,
    }))
}

/// Freshness gate for rollout-noisy alerts: at most one run per identity
/// per hour. Returns `None` to skip, or the job with the overwrite flag
/// set when an older artifact exists.
pub async fn apply_freshness_gate(
    index: Option<&Index>,
    config: &Config,
    mut job: InvestigationJob,
    now: DateTime<Utc>,
) -> Option<InvestigationJob> {
    if !is_rollout_noisy(&job.alert.alertname, &config.rollout_noisy_extra) {
        return Some(job);
    }
    let Some(index) = index else {
        return Some(job);
    };

    let case = case_id(&job.identity, job.family);
    match index.last_run_at(&case).await {
        Ok(Some(last)) => {
            let age = now.signed_duration_since(last);
            let window = chrono::Duration::from_std(FRESHNESS_WINDOW)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            if age < window {
                info!(case = %case, age_secs = age.num_seconds(), "freshness_gate_skip");
                None
            } else {
                // Stale run: mark the existing artifact for overwrite.
                job.overwrite = true;
                Some(job)
            }
        }
        Ok(None) => Some(job),
        Err(e) => {
            // A broken index never blocks ingestion.
            warn!(error = %e, "freshness_gate_index_error");
            Some(job)
        }
    }
}

/* ============================= HTTP ============================= */

#[derive(Clone)]
pub struct IngestState {
    pub config: Arc<Config>,
    pub queue: Arc<Queue>,
    pub index: Option<Arc<Index>>,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub enqueued: u64,
    pub skipped_allowlist: u64,
    pub skipped_freshness: u64,
    pub skipped_resolved: u64,
}

pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/alerts", post(handle_alerts))
        .route("/healthz", get(handle_healthz))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

async fn handle_alerts(
    State(state): State<IngestState>,
    body: Result<axum::Json<AlertmanagerPayload>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let payload = match body {
        Ok(axum::Json(p)) => p,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };

    // Convert everything up front: a malformed alert rejects the whole
    // payload before anything is enqueued.
    let mut alerts = Vec::with_capacity(payload.alerts.len());
    for am in &payload.alerts {
        match to_alert_instance(am) {
            Ok(alert) => alerts.push(alert),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(serde_json::json!({ "error": e })),
                )
                    .into_response();
            }
        }
    }

    let now = Utc::now();
    let mut stats = IngestStats::default();
    let mut to_publish: Vec<InvestigationJob> = Vec::new();

    for alert in alerts {
        stats.received += 1;
        ALERTS_RECEIVED.inc();
        match evaluate_alert(&state.config, alert, now) {
            GateDecision::SkipResolved => stats.skipped_resolved += 1,
            GateDecision::SkipAllowlist => {
                stats.skipped_allowlist += 1;
                SKIPPED_ALLOWLIST.inc();
            }
            GateDecision::Enqueue(job) => {
                match apply_freshness_gate(state.index.as_deref(), &state.config, *job, now).await {
                    Some(job) => to_publish.push(job),
                    None => {
                        stats.skipped_freshness += 1;
                        SKIPPED_FRESHNESS.inc();
                    }
                }
            }
        }
    }

    for job in &to_publish {
        if let Err(e) = state.queue.publish_job(job).await {
            warn!(error = %e, "queue_publish_failed");
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": "queue_publish_failed" })),
            )
                .into_response();
        }
        stats.enqueued += 1;
        ALERTS_ENQUEUED.inc();
    }

    info!(
        received = stats.received,
        enqueued = stats.enqueued,
        skipped_allowlist = stats.skipped_allowlist,
        skipped_freshness = stats.skipped_freshness,
        "webhook_batch_processed"
    );

    (StatusCode::ACCEPTED, axum::Json(serde_json::to_value(&stats).expect("stats serialize")))
        .into_response()
}

async fn handle_healthz(State(state): State<IngestState>) -> impl IntoResponse {
    let index_status = match &state.index {
        Some(index) => match index.ping().await {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("degraded: {e}"),
        },
        None => "not_configured".to_string(),
    };
    let degraded = index_status.starts_with("degraded");

    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "components": {
            "queue": "connected",
            "index": index_status,
        },
    });
    (StatusCode::OK, axum::Json(body))
}

async fn handle_metrics() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&INGEST_REGISTRY.gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn test_config(allowlist: &[&str]) -> Config {
        use crate::config::*;
        Config {
            cluster_name: "main".into(),
            prometheus_url: None,
            alertmanager_url: None,
            logs_url: None,
            logs_backend: LogsBackend::Auto,
            s3_bucket: None,
            s3_prefix: "tarka".into(),
            s3_endpoint_url: None,
            database_url: None,
            queue: QueueConfig {
                nats_url: "nats://localhost:4222".into(),
                stream: "TARKA".into(),
                subject: "tarka.alerts".into(),
                durable: "tarka-worker".into(),
                ack_wait: Duration::from_secs(300),
                max_deliver: 4,
                backoff: vec![Duration::from_secs(5)],
                dlq_stream: "TARKA_DLQ".into(),
                dlq_subject: "tarka.dlq".into(),
                completions_subject: "tarka.completions".into(),
                duplicate_window: Duration::from_secs(120),
            },
            worker: WorkerConfig { concurrency: 2, fetch_batch: 4 },
            time_window: Duration::from_secs(3600),
            time_window_max: Duration::from_secs(6 * 3600),
            pipeline_budget: Duration::from_secs(120),
            alertname_allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
            rollout_noisy_extra: vec![],
            aws: AwsConfig {
                enabled: false,
                cloudtrail_lookback: Duration::from_secs(3600),
                cloudtrail_max_events: 50,
            },
            github: GithubConfig { enabled: false, token: None, repo: None },
            llm: LlmConfig {
                enabled: false,
                url: None,
                model: "m".into(),
                api_key: None,
                include_logs: false,
                redact_infrastructure: true,
            },
        }
    }

    fn firing(alertname: &str, labels: &[(&str, &str)]) -> AlertInstance {
        let mut all: BTreeMap<String, String> =
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        all.insert("alertname".into(), alertname.into());
        AlertInstance {
            fingerprint: "f1".into(),
            alertname: alertname.into(),
            labels: all,
            annotations: BTreeMap::new(),
            starts_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
            ends_at: None,
            status: AlertStatus::Firing,
        }
    }

    #[test]
    fn test_resolved_alerts_skipped() {
        let config = test_config(&[]);
        let mut alert = firing("CPUThrottlingHigh", &[("namespace", "prod"), ("pod", "p")]);
        alert.status = AlertStatus::Resolved;
        assert_eq!(
            evaluate_alert(&config, alert, Utc::now()),
            GateDecision::SkipResolved
        );
    }

    #[test]
    fn test_allowlist_drops_unlisted_alert() {
        let config = test_config(&["CPUThrottlingHigh"]);
        let alert = firing("Watchdog", &[]);
        assert_eq!(
            evaluate_alert(&config, alert, Utc::now()),
            GateDecision::SkipAllowlist
        );
    }

    #[test]
    fn test_allowlist_is_exact_and_case_sensitive() {
        let config = test_config(&["CPUThrottlingHigh"]);
        let alert = firing("cputhrottlinghigh", &[("namespace", "prod"), ("pod", "p")]);
        assert_eq!(
            evaluate_alert(&config, alert, Utc::now()),
            GateDecision::SkipAllowlist
        );

        let alert = firing("CPUThrottlingHigh", &[("namespace", "prod"), ("pod", "p")]);
        assert!(matches!(
            evaluate_alert(&config, alert, Utc::now()),
            GateDecision::Enqueue(_)
        ));
    }

    #[test]
    fn test_empty_allowlist_admits_everything() {
        let config = test_config(&[]);
        let alert = firing("AnythingGoes", &[("namespace", "prod"), ("pod", "p")]);
        assert!(matches!(
            evaluate_alert(&config, alert, Utc::now()),
            GateDecision::Enqueue(_)
        ));
    }

    #[test]
    fn test_rollout_noisy_rescopes_to_workload() {
        let config = test_config(&[]);
        let alert = firing(
            "KubernetesPodNotHealthy",
            &[("namespace", "prod"), ("pod", "web-app-5d4f8b9c7f-x2v9q")],
        );
        match evaluate_alert(&config, alert, Utc::now()) {
            GateDecision::Enqueue(job) => match &job.identity {
                Identity::Workload { owner, .. } => assert_eq!(owner, "web-app"),
                other => panic!("expected workload identity, got {other:?}"),
            },
            other => panic!("expected enqueue, got {other:?}"),
        }
    }

    #[test]
    fn test_dedup_key_is_stable_within_bucket() {
        let config = test_config(&[]);
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let a1 = firing("CPUThrottlingHigh", &[("namespace", "prod"), ("pod", "p")]);
        let a2 = firing("CPUThrottlingHigh", &[("namespace", "prod"), ("pod", "p")]);
        let (j1, j2) = match (
            evaluate_alert(&config, a1, now),
            evaluate_alert(&config, a2, now + chrono::Duration::minutes(30)),
        ) {
            (GateDecision::Enqueue(j1), GateDecision::Enqueue(j2)) => (j1, j2),
            other => panic!("expected enqueues, got {other:?}"),
        };
        assert_eq!(j1.dedup_key(), j2.dedup_key());
    }

    #[test]
    fn test_to_alert_instance_requires_alertname() {
        let am = AmAlert {
            status: "firing".into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            fingerprint: "f".into(),
        };
        assert!(to_alert_instance(&am).is_err());
    }

    #[test]
    fn test_to_alert_instance_zero_ends_at_is_none() {
        let mut labels = BTreeMap::new();
        labels.insert("alertname".to_string(), "X".to_string());
        let am = AmAlert {
            status: "firing".into(),
            labels,
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            ends_at: Some(Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()),
            fingerprint: "f".into(),
        };
        assert_eq!(to_alert_instance(&am).unwrap().ends_at, None);
    }

    #[test]
    fn test_identity_missing_still_enqueues_for_scenario_a() {
        let config = test_config(&[]);
        let alert = firing("SomethingBroke", &[]);
        match evaluate_alert(&config, alert, Utc::now()) {
            GateDecision::Enqueue(job) => {
                assert!(matches!(job.identity, Identity::Unknown | Identity::NonPod { .. }));
            }
            other => panic!("expected enqueue, got {other:?}"),
        }
    }
}
