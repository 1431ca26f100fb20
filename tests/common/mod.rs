//! Shared fixtures for the integration suites. No cluster, queue, or
//! object store is required; everything here builds in-memory evidence.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use tarka::config::{
    AwsConfig, Config, GithubConfig, LlmConfig, LogsBackend, QueueConfig, WorkerConfig,
};
use tarka::evidence::{
    ContainerSnapshot, ContainerState, Evidence, JobSnapshot, K8sEvidence, LogEntry, LogsEvidence,
    PodSnapshot, Slot, TerminationRecord,
};
use tarka::model::{AlertInstance, AlertStatus, Family, Identity, InvestigationJob, TimeWindow};

pub fn test_config() -> Config {
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
            backoff: vec![Duration::from_secs(5), Duration::from_secs(30)],
            dlq_stream: "TARKA_DLQ".into(),
            dlq_subject: "tarka.dlq".into(),
            completions_subject: "tarka.completions".into(),
            duplicate_window: Duration::from_secs(120),
        },
        worker: WorkerConfig { concurrency: 2, fetch_batch: 4 },
        time_window: Duration::from_secs(3600),
        time_window_max: Duration::from_secs(6 * 3600),
        pipeline_budget: Duration::from_secs(30),
        alertname_allowlist: vec![],
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
            model: "test".into(),
            api_key: None,
            include_logs: false,
            redact_infrastructure: true,
        },
    }
}

pub fn make_alert(alertname: &str, labels: &[(&str, &str)]) -> AlertInstance {
    let mut all: BTreeMap<String, String> =
        labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    all.insert("alertname".into(), alertname.into());
    AlertInstance {
        fingerprint: format!("fp-{alertname}"),
        alertname: alertname.into(),
        labels: all,
        annotations: BTreeMap::new(),
        starts_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
        ends_at: None,
        status: AlertStatus::Firing,
    }
}

pub fn make_job(alert: AlertInstance, config: &Config) -> InvestigationJob {
    let identity = Identity::from_alert(&alert, &config.cluster_name);
    let family = Family::infer(&alert);
    InvestigationJob {
        identity,
        family,
        window: TimeWindow::ending_at(alert.starts_at, config.time_window),
        alert,
        dedup_bucket: 123456,
        overwrite: false,
    }
}

/// Seed fixture: CrashLoopBackOff pod whose container was OOMKilled with
/// exit 137, 15 restarts, and a 512Mi limit.
pub fn crashloop_oom_pod() -> PodSnapshot {
    PodSnapshot {
        name: "web-abc".into(),
        namespace: "prod".into(),
        phase: "Running".into(),
        node: Some("node-1".into()),
        conditions: vec![],
        containers: vec![ContainerSnapshot {
            name: "app".into(),
            image: "registry.internal/web:v1".into(),
            ready: false,
            restart_count: 15,
            state: ContainerState::Waiting { reason: "CrashLoopBackOff".into() },
            last_terminated: Some(TerminationRecord {
                reason: "OOMKilled".into(),
                exit_code: 137,
                finished_at: Some(Utc.with_ymd_and_hms(2026, 7, 1, 11, 58, 0).unwrap()),
            }),
            memory_limit_bytes: Some(512 * 1024 * 1024),
            cpu_limit_millis: Some(500),
        }],
        init_containers: vec![],
        owner: None,
        created_at: Some(Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap()),
        deleted: false,
    }
}

pub fn crashloop_oom_evidence() -> Evidence {
    let mut evidence = Evidence::pending(false, false);
    evidence.k8s = Slot::ok(K8sEvidence {
        pod: Some(crashloop_oom_pod()),
        workload: None,
        job: None,
        events: vec![],
    });
    // Peak working set just under the 512Mi limit.
    let mut series = BTreeMap::new();
    series.insert(
        "memory_working_set_bytes".to_string(),
        tarka::evidence::MetricSeries {
            query: "max(container_memory_working_set_bytes{namespace=\"prod\",pod=\"web-abc\"})"
                .into(),
            points: vec![(1782907200, 490.0 * 1024.0 * 1024.0)],
            latest: Some(490.0 * 1024.0 * 1024.0),
        },
    );
    series.insert(
        "memory_limit_bytes".to_string(),
        tarka::evidence::MetricSeries {
            query: "max(kube_pod_container_resource_limits{resource=\"memory\"})".into(),
            points: vec![(1782907200, 512.0 * 1024.0 * 1024.0)],
            latest: Some(512.0 * 1024.0 * 1024.0),
        },
    );
    evidence.metrics = Slot::ok(tarka::evidence::MetricsEvidence { series });
    evidence
}

/// Seed fixture: a failed Job whose pod was garbage-collected; logs came
/// back through the pod-prefix fallback with ERROR lines.
pub fn ttl_deleted_job_evidence() -> Evidence {
    let mut evidence = Evidence::pending(false, false);
    evidence.k8s = Slot::ok(K8sEvidence {
        pod: None,
        workload: None,
        job: Some(JobSnapshot {
            name: "nightly-sync".into(),
            namespace: "batch".into(),
            attempts: 4,
            backoff_limit: 3,
            active: 0,
            succeeded: 0,
            failed: 4,
            completion_deadline_seconds: None,
            failure_reason: Some("BackoffLimitExceeded".into()),
        }),
        events: vec![],
    });
    let entries = vec![
        LogEntry {
            timestamp: Some(Utc.with_ymd_and_hms(2026, 7, 1, 11, 40, 0).unwrap()),
            line: "2026-07-01T11:40:00Z ERROR: upstream sync failed: connection refused".into(),
        },
        LogEntry {
            timestamp: Some(Utc.with_ymd_and_hms(2026, 7, 1, 11, 41, 0).unwrap()),
            line: "2026-07-01T11:41:00Z ERROR: upstream sync failed: connection refused".into(),
        },
        LogEntry {
            timestamp: Some(Utc.with_ymd_and_hms(2026, 7, 1, 11, 42, 0).unwrap()),
            line: "2026-07-01T11:42:00Z FATAL: giving up after 3 attempts".into(),
        },
    ];
    let parsed_patterns = tarka::logparse::parse_entries(&entries);
    evidence.logs = Slot::ok(LogsEvidence {
        backend: "victorialogs".into(),
        query: "namespace:\"batch\" AND pod:~\"nightly-sync.*\"".into(),
        entries,
        parsed_patterns,
        historical_fallback: true,
    });
    evidence
}
