//! Evidence collectors.
//!
//! Deterministic, idempotent functions that populate typed evidence slots
//! through the providers. Best-effort: on partial failure they fill what is
//! available and mark the rest unavailable. Every collector runs under a
//! caller-supplied deadline and never overwrites a populated slot.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::timeout;

use crate::config::Config;
use crate::evidence::{
    AwsEvidence, ChangeSignals, Evidence, GithubEvidence, K8sEvidence, LogsEvidence,
    MetricsEvidence, Slot, SlotStatus,
};
use crate::logparse;
use crate::model::{Identity, TimeWindow};
use crate::providers::aws::AwsProvider;
use crate::providers::github::GithubProvider;
use crate::providers::k8s::K8sProvider;
use crate::providers::logs::LogsProvider;
use crate::providers::prometheus::{MetricsProvider, label_matchers, label_matchers_prefix};
use crate::providers::{REASON_NOT_CONFIGURED, REASON_TIMEOUT};

/* ============================= PROVIDER BUNDLE ============================= */

/// Everything the pipeline can read from, constructed once at startup.
/// Absent providers are represented as `None` and collectors mark their
/// slots `not_configured`.
pub struct Providers {
    pub metrics: Option<MetricsProvider>,
    pub k8s: Option<K8sProvider>,
    pub logs: Option<LogsProvider>,
    pub aws: Option<AwsProvider>,
    pub github: Option<GithubProvider>,
}

impl Providers {
    pub async fn from_config(config: &Config) -> Providers {
        Providers {
            metrics: config.prometheus_url.as_deref().map(MetricsProvider::new),
            k8s: K8sProvider::connect().await.ok(),
            logs: config
                .logs_url
                .as_deref()
                .map(|url| LogsProvider::new(url, config.logs_backend)),
            aws: if config.aws.enabled {
                Some(AwsProvider::connect().await)
            } else {
                None
            },
            github: if config.github.enabled {
                config
                    .github
                    .repo
                    .as_deref()
                    .map(|repo| GithubProvider::new(repo, config.github.token.clone()))
            } else {
                None
            },
        }
    }
}

/// Run a collector future under a deadline; elapsing the deadline yields
/// an unavailable slot rather than an error.
async fn bounded<T>(
    budget: Duration,
    fut: impl Future<Output = Slot<T>>,
) -> Slot<T> {
    match timeout(budget, fut).await {
        Ok(slot) => slot,
        Err(_) => Slot::unavailable(REASON_TIMEOUT),
    }
}

/* ============================= K8S ============================= */

pub async fn collect_k8s(
    k8s: Option<&K8sProvider>,
    identity: &Identity,
    budget: Duration,
) -> Slot<K8sEvidence> {
    let Some(k8s) = k8s else {
        return Slot::unavailable(REASON_NOT_CONFIGURED);
    };
    bounded(budget, collect_k8s_inner(k8s, identity)).await
}

async fn collect_k8s_inner(k8s: &K8sProvider, identity: &Identity) -> Slot<K8sEvidence> {
    match identity {
        Identity::Pod { namespace, pod, .. } => {
            let (pod_slot, events_slot) =
                tokio::join!(k8s.pod(namespace, pod), k8s.events(namespace, pod));

            match pod_slot {
                Slot { status: SlotStatus::Ok, data: Some(snapshot) } => {
                    // Follow the owner chain so workload-level context is
                    // available even for pod-scoped alerts.
                    let workload = match k8s.resolve_owner_via_api(&snapshot).await {
                        Some(owner) => k8s.workload(&owner).await.data,
                        None => None,
                    };
                    Slot::ok(K8sEvidence {
                        pod: Some(snapshot),
                        workload,
                        job: None,
                        events: events_slot.data.unwrap_or_default(),
                    })
                }
                Slot { status: SlotStatus::Empty, .. } => {
                    // Pod is gone (TTL or rollout); events may still exist.
                    Slot::ok(K8sEvidence {
                        pod: None,
                        workload: None,
                        job: None,
                        events: events_slot.data.unwrap_or_default(),
                    })
                }
                Slot { status, .. } => Slot {
                    status,
                    data: None,
                },
            }
        }
        Identity::Workload { namespace, kind, owner, .. } => {
            let workload_ref = crate::evidence::WorkloadRef {
                kind: kind.clone(),
                name: owner.clone(),
                namespace: namespace.clone(),
            };
            let (workload_slot, events_slot) =
                tokio::join!(k8s.workload(&workload_ref), k8s.events(namespace, owner));
            match workload_slot {
                Slot { status: SlotStatus::Ok, data } => Slot::ok(K8sEvidence {
                    pod: None,
                    workload: data,
                    job: None,
                    events: events_slot.data.unwrap_or_default(),
                }),
                Slot { status, .. } => Slot { status, data: None },
            }
        }
        Identity::Job { namespace, job, .. } => {
            let (job_slot, pods_slot, events_slot) = tokio::join!(
                k8s.job(namespace, job),
                k8s.pods_for_job(namespace, job),
                k8s.events(namespace, job)
            );
            match job_slot {
                Slot { status: SlotStatus::Unavailable { reason }, .. } => {
                    Slot::unavailable(reason)
                }
                Slot { data: job_data, .. } => {
                    // Prefer a failed pod's snapshot; any pod beats none.
                    let pod = pods_slot.data.and_then(|pods| {
                        pods.iter()
                            .find(|p| p.phase == "Failed")
                            .cloned()
                            .or_else(|| pods.into_iter().next_back())
                    });
                    Slot::ok(K8sEvidence {
                        pod,
                        workload: None,
                        job: job_data,
                        events: events_slot.data.unwrap_or_default(),
                    })
                }
            }
        }
        Identity::NonPod { .. } => Slot::empty(),
        Identity::Unknown => Slot::unavailable("target_identity_missing"),
    }
}

/* ============================= METRICS ============================= */

/// Family-scoped PromQL set. Series names are stable; the renderer and
/// diagnostics address series by name, never by position.
pub fn metric_queries(
    family: crate::model::Family,
    identity: &Identity,
) -> Vec<(&'static str, String)> {
    use crate::model::Family;

    let (namespace, pod) = (identity.namespace(), identity.pod_name());
    let matchers = label_matchers(namespace, pod, None);
    let pod_or_prefix = match identity {
        Identity::Workload { namespace, owner, .. } => label_matchers_prefix(namespace, owner),
        Identity::Job { namespace, job, .. } => label_matchers_prefix(namespace, job),
        _ => matchers.clone(),
    };

    let mut queries: Vec<(&'static str, String)> = vec![
        (
            "cpu_usage_cores",
            format!("sum(rate(container_cpu_usage_seconds_total{{{pod_or_prefix}}}[5m]))"),
        ),
        (
            "memory_working_set_bytes",
            format!("max(container_memory_working_set_bytes{{{pod_or_prefix}}})"),
        ),
        (
            "restarts_total",
            format!("max(kube_pod_container_status_restarts_total{{{pod_or_prefix}}})"),
        ),
    ];

    match family {
        Family::CpuThrottling => {
            queries.push((
                "cpu_throttle_ratio",
                format!(
                    "sum(rate(container_cpu_cfs_throttled_periods_total{{{pod_or_prefix}}}[5m])) / sum(rate(container_cpu_cfs_periods_total{{{pod_or_prefix}}}[5m]))"
                ),
            ));
        }
        Family::OomKilled | Family::MemoryPressure | Family::PodNotHealthy => {
            queries.push((
                "memory_limit_bytes",
                format!(
                    "max(kube_pod_container_resource_limits{{resource=\"memory\",{pod_or_prefix}}})"
                ),
            ));
        }
        Family::Http5xx => {
            if let Some(ns) = namespace {
                queries.push((
                    "http_5xx_rate",
                    format!(
                        "sum(rate(http_requests_total{{namespace=\"{ns}\",code=~\"5..\"}}[5m]))"
                    ),
                ));
                queries.push((
                    "http_total_rate",
                    format!("sum(rate(http_requests_total{{namespace=\"{ns}\"}}[5m]))"),
                ));
            }
        }
        Family::K8sRollout | Family::JobFailed => {
            if let Some(ns) = namespace {
                queries.push((
                    "replica_available_ratio",
                    format!(
                        "min(kube_deployment_status_replicas_available{{namespace=\"{ns}\"}} / clamp_min(kube_deployment_spec_replicas{{namespace=\"{ns}\"}}, 1))"
                    ),
                ));
            }
        }
        Family::TargetDown => {
            // Scope `up` by whatever target labels the alert carried.
            let mut parts = Vec::new();
            if let Some(ns) = namespace {
                parts.push(format!("namespace=\"{ns}\""));
            }
            if let Identity::NonPod { labels } = identity {
                if let Some(job) = labels.get("job") {
                    parts.push(format!("job=\"{job}\""));
                }
            }
            queries.push(("scrape_up", format!("min(up{{{}}})", parts.join(","))));
        }
        _ => {}
    }

    queries
}

pub async fn collect_metrics(
    metrics: Option<&MetricsProvider>,
    family: crate::model::Family,
    identity: &Identity,
    window: TimeWindow,
    budget: Duration,
) -> Slot<MetricsEvidence> {
    let Some(metrics) = metrics else {
        return Slot::unavailable(REASON_NOT_CONFIGURED);
    };
    bounded(budget, async {
        let queries = metric_queries(family, identity);
        let step = step_for(window);
        let results = join_all(queries.iter().map(|(name, query)| async move {
            (*name, metrics.range(query, window.start, window.end, step).await)
        }))
        .await;

        let mut series = BTreeMap::new();
        let mut first_unavailable: Option<String> = None;
        let mut any_ok = false;
        for (name, slot) in results {
            match slot {
                Slot { status: SlotStatus::Ok, data: Some(s) } => {
                    any_ok = true;
                    series.insert(name.to_string(), s);
                }
                Slot { status: SlotStatus::Unavailable { reason }, .. } => {
                    first_unavailable.get_or_insert(reason);
                }
                _ => {}
            }
        }

        if any_ok {
            Slot::ok(MetricsEvidence { series })
        } else if let Some(reason) = first_unavailable {
            Slot::unavailable(reason)
        } else {
            Slot::empty()
        }
    })
    .await
}

/// Query step that keeps point counts bounded across window sizes.
fn step_for(window: TimeWindow) -> u64 {
    let span = (window.end - window.start).num_seconds().max(60) as u64;
    (span / 60).clamp(30, 300)
}

/* ============================= LOGS ============================= */

const LOG_LIMIT: usize = 500;

/// Tail logs for the target; when the live pod is gone, fall back to a
/// pod-name-prefix query across retention.
pub async fn collect_logs(
    logs: Option<&LogsProvider>,
    identity: &Identity,
    container: Option<&str>,
    window: TimeWindow,
    pod_exists: bool,
    budget: Duration,
) -> Slot<LogsEvidence> {
    let Some(logs) = logs else {
        return Slot::unavailable(REASON_NOT_CONFIGURED);
    };

    let Some(namespace) = identity.namespace().map(str::to_string) else {
        return Slot::unavailable("target_identity_missing");
    };

    bounded(budget, async {
        let (fetch, historical) = match identity {
            Identity::Pod { pod, .. } if pod_exists => (
                logs.tail(&namespace, pod, container, window.start, window.end, LOG_LIMIT)
                    .await,
                false,
            ),
            Identity::Pod { pod, .. } => (
                logs.tail_by_prefix(&namespace, prefix_of(pod), window.start, window.end, LOG_LIMIT)
                    .await,
                true,
            ),
            Identity::Workload { owner, .. } => (
                logs.tail_by_prefix(&namespace, owner, window.start, window.end, LOG_LIMIT)
                    .await,
                true,
            ),
            Identity::Job { job, .. } => (
                logs.tail_by_prefix(&namespace, job, window.start, window.end, LOG_LIMIT)
                    .await,
                true,
            ),
            _ => return Slot::unavailable("target_identity_missing"),
        };

        match fetch {
            Slot { status: SlotStatus::Unavailable { reason }, .. } => Slot::unavailable(reason),
            Slot { status, data } => {
                let fetch = data.expect("ok/empty log fetch carries data");
                let parsed_patterns = logparse::parse_entries(&fetch.entries);
                Slot {
                    status,
                    data: Some(LogsEvidence {
                        backend: fetch.backend.as_str().to_string(),
                        query: fetch.query,
                        entries: fetch.entries,
                        parsed_patterns,
                        historical_fallback: historical,
                    }),
                }
            }
        }
    })
    .await
}

/// Stable prefix of a generated pod name: strips trailing hash-like
/// segments (`web-app-5d4f8b9c7f-x2v9q` → `web-app`).
pub fn prefix_of(pod_name: &str) -> &str {
    let mut end = pod_name.len();
    for _ in 0..2 {
        if let Some(pos) = pod_name[..end].rfind('-') {
            let segment = &pod_name[pos + 1..end];
            let hashy = segment.len() >= 4
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if hashy && pos > 0 {
                end = pos;
                continue;
            }
        }
        break;
    }
    &pod_name[..end]
}

/* ============================= AWS ============================= */

pub async fn collect_aws(
    aws: Option<&AwsProvider>,
    window: TimeWindow,
    config: &Config,
    budget: Duration,
) -> Slot<AwsEvidence> {
    let Some(aws) = aws else {
        return Slot::unavailable(REASON_NOT_CONFIGURED);
    };
    bounded(budget, async {
        let lookback_start = window.end
            - chrono::Duration::from_std(config.aws.cloudtrail_lookback)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let (subsystems, cloudtrail) = tokio::join!(
            aws.snapshots(),
            aws.cloudtrail_events(lookback_start, window.end, config.aws.cloudtrail_max_events)
        );
        Slot::ok(AwsEvidence { subsystems, cloudtrail })
    })
    .await
}

/* ============================= GITHUB ============================= */

pub async fn collect_github(
    github: Option<&GithubProvider>,
    window: TimeWindow,
    budget: Duration,
) -> Slot<GithubEvidence> {
    let Some(github) = github else {
        return Slot::unavailable(REASON_NOT_CONFIGURED);
    };
    bounded(budget, github.recent_activity(window.start)).await
}

/* ============================= CHANGE CORRELATION ============================= */

/// Change-y event reasons worth surfacing as deploy/rollout signals.
const CHANGE_EVENT_REASONS: &[&str] = &[
    "ScalingReplicaSet",
    "SuccessfulCreate",
    "SuccessfulDelete",
    "Pulled",
    "Killing",
    "Started",
];

/// Pure correlation over already-collected evidence; no I/O. Scans K8s
/// events, CloudTrail, and GitHub activity inside the window and keeps
/// the most recent change signal per source.
pub fn correlate_change(evidence: &Evidence, window: TimeWindow) -> Slot<ChangeSignals> {
    let mut signals: Vec<(Option<DateTime<Utc>>, String, String)> = Vec::new();

    for event in evidence.events() {
        if CHANGE_EVENT_REASONS.contains(&event.reason.as_str()) {
            let in_window = event
                .last_seen
                .map(|t| t >= window.start && t <= window.end)
                .unwrap_or(false);
            if in_window {
                signals.push((
                    event.last_seen,
                    "k8s_events".to_string(),
                    format!("{}: {}", event.reason, event.message),
                ));
            }
        }
    }

    if let Some(aws) = evidence.aws.as_ref().and_then(|slot| slot.get()) {
        if let Some(events) = aws.cloudtrail.get() {
            for e in events {
                signals.push((
                    e.event_time,
                    "cloudtrail".to_string(),
                    match &e.username {
                        Some(user) => format!("{} by {user}", e.event_name),
                        None => e.event_name.clone(),
                    },
                ));
            }
        }
    }

    if let Some(github) = evidence.github.as_ref().and_then(|slot| slot.get()) {
        for c in &github.commits {
            signals.push((
                c.committed_at,
                "github".to_string(),
                format!("commit {}: {}", &c.sha[..c.sha.len().min(7)], c.message),
            ));
        }
        for r in &github.workflow_runs {
            if r.conclusion.as_deref() == Some("failure") {
                let text = if r.failed_jobs.is_empty() {
                    format!("workflow {} failed", r.name)
                } else {
                    format!("workflow {} failed at {}", r.name, r.failed_jobs.join(", "))
                };
                signals.push((r.created_at, "github".to_string(), text));
            }
        }
    }

    if signals.is_empty() {
        return Slot::empty();
    }

    signals.sort_by_key(|(ts, _, _)| *ts);
    let (last_change_time, source, summary) = signals
        .last()
        .map(|(ts, src, text)| (*ts, src.clone(), text.clone()))
        .expect("signals is non-empty");

    Slot::ok(ChangeSignals {
        summary: Some(summary),
        last_change_time,
        source: Some(source),
        signals: signals.iter().map(|(_, src, text)| format!("[{src}] {text}")).collect(),
    })
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EventSnapshot, K8sEvidence};
    use crate::model::Family;
    use chrono::TimeZone;

    fn window() -> TimeWindow {
        TimeWindow {
            start: Utc.with_ymd_and_hms(2026, 7, 1, 11, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_prefix_of_strips_hash_segments() {
        assert_eq!(prefix_of("web-app-5d4f8b9c7f-x2v9q"), "web-app");
        assert_eq!(prefix_of("nightly-sync-29381"), "nightly-sync");
        assert_eq!(prefix_of("plain"), "plain");
    }

    #[test]
    fn test_metric_queries_family_scoped() {
        let identity = Identity::Pod {
            cluster: "main".into(),
            namespace: "prod".into(),
            pod: "web-abc".into(),
        };
        let names: Vec<&str> = metric_queries(Family::CpuThrottling, &identity)
            .iter()
            .map(|(n, _)| *n)
            .collect();
        assert!(names.contains(&"cpu_throttle_ratio"));

        let names: Vec<&str> = metric_queries(Family::OomKilled, &identity)
            .iter()
            .map(|(n, _)| *n)
            .collect();
        assert!(names.contains(&"memory_limit_bytes"));
        assert!(names.contains(&"memory_working_set_bytes"));
    }

    #[test]
    fn test_metric_queries_target_down_scopes_up_by_job() {
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("job".to_string(), "node-exporter".to_string());
        let identity = Identity::NonPod { labels };
        let queries = metric_queries(Family::TargetDown, &identity);
        let (_, up) = queries
            .iter()
            .find(|(n, _)| *n == "scrape_up")
            .expect("target_down family collects the up series");
        assert!(up.contains("job=\"node-exporter\""), "query: {up}");
    }

    #[test]
    fn test_metric_queries_inject_target_labels() {
        let identity = Identity::Pod {
            cluster: "main".into(),
            namespace: "prod".into(),
            pod: "web-abc".into(),
        };
        for (_, query) in metric_queries(Family::Generic, &identity) {
            assert!(query.contains("namespace=\"prod\""), "query: {query}");
        }
    }

    #[test]
    fn test_correlate_change_empty_when_no_signals() {
        let mut ev = Evidence::pending(false, false);
        ev.k8s = Slot::ok(K8sEvidence { pod: None, workload: None, job: None, events: vec![] });
        let slot = correlate_change(&ev, window());
        assert_eq!(slot.status, SlotStatus::Empty);
    }

    #[test]
    fn test_correlate_change_picks_latest_signal() {
        let mut ev = Evidence::pending(false, false);
        ev.k8s = Slot::ok(K8sEvidence {
            pod: None,
            workload: None,
            job: None,
            events: vec![
                EventSnapshot {
                    event_type: "Normal".into(),
                    reason: "ScalingReplicaSet".into(),
                    message: "Scaled up replica set web-abc to 3".into(),
                    count: 1,
                    last_seen: Some(Utc.with_ymd_and_hms(2026, 7, 1, 11, 30, 0).unwrap()),
                    object: "web".into(),
                },
                EventSnapshot {
                    event_type: "Normal".into(),
                    reason: "Pulled".into(),
                    message: "Pulled image web:v2".into(),
                    count: 1,
                    last_seen: Some(Utc.with_ymd_and_hms(2026, 7, 1, 11, 45, 0).unwrap()),
                    object: "web".into(),
                },
            ],
        });
        let slot = correlate_change(&ev, window());
        let change = slot.get().unwrap();
        assert_eq!(change.source.as_deref(), Some("k8s_events"));
        assert!(change.summary.as_deref().unwrap().starts_with("Pulled"));
        assert_eq!(change.signals.len(), 2);
    }

    #[test]
    fn test_correlate_change_ignores_out_of_window_events() {
        let mut ev = Evidence::pending(false, false);
        ev.k8s = Slot::ok(K8sEvidence {
            pod: None,
            workload: None,
            job: None,
            events: vec![EventSnapshot {
                event_type: "Normal".into(),
                reason: "Pulled".into(),
                message: "old".into(),
                count: 1,
                last_seen: Some(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()),
                object: "web".into(),
            }],
        });
        assert_eq!(correlate_change(&ev, window()).status, SlotStatus::Empty);
    }
}
