//! Family playbooks.
//!
//! A playbook names the collectors a family needs and an interpreter that
//! turns collected evidence plus findings into an enrichment, hypotheses,
//! a verdict, and feature values. Interpreters are pure functions: no
//! external calls, unknowns preserved verbatim, nothing invented.

use serde_json::json;

use crate::evidence::Evidence;
use crate::logparse::{PatternKind, count_kind};
use crate::model::{
    AlertInstance, Enrichment, Family, Finding, FindingSeverity, Hypothesis, Identity,
};

/* ============================= TYPES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    K8s,
    Metrics,
    Logs,
    Aws,
    Github,
    Change,
}

pub struct PlaybookInput<'a> {
    pub alert: &'a AlertInstance,
    pub identity: &'a Identity,
    pub family: Family,
    pub evidence: &'a Evidence,
    pub findings: &'a [Finding],
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookOutput {
    pub enrichment: Enrichment,
    pub hypotheses: Vec<Hypothesis>,
    pub verdict: Option<String>,
    pub features: serde_json::Value,
}

pub struct Playbook {
    pub name: &'static str,
    pub collectors: &'static [CollectorKind],
    pub interpreter: fn(&PlaybookInput) -> PlaybookOutput,
}

/* ============================= REGISTRY ============================= */

const FULL_SET: &[CollectorKind] = &[
    CollectorKind::K8s,
    CollectorKind::Metrics,
    CollectorKind::Logs,
    CollectorKind::Aws,
    CollectorKind::Github,
    CollectorKind::Change,
];

const POD_SET: &[CollectorKind] = &[
    CollectorKind::K8s,
    CollectorKind::Metrics,
    CollectorKind::Logs,
    CollectorKind::Change,
];

const NONPOD_SET: &[CollectorKind] =
    &[CollectorKind::Metrics, CollectorKind::Aws, CollectorKind::Change];

static CPU_THROTTLING: Playbook =
    Playbook { name: "cpu_throttling", collectors: POD_SET, interpreter: interpret_cpu_throttling };
static OOM_KILLED: Playbook =
    Playbook { name: "oom_killed", collectors: POD_SET, interpreter: interpret_oom };
static POD_NOT_HEALTHY: Playbook =
    Playbook { name: "pod_not_healthy", collectors: FULL_SET, interpreter: interpret_pod_not_healthy };
static HTTP_5XX: Playbook =
    Playbook { name: "http_5xx", collectors: FULL_SET, interpreter: interpret_http_5xx };
static MEMORY_PRESSURE: Playbook =
    Playbook { name: "memory_pressure", collectors: POD_SET, interpreter: interpret_memory_pressure };
static JOB_FAILED: Playbook =
    Playbook { name: "job_failed", collectors: POD_SET, interpreter: interpret_job_failed };
static TARGET_DOWN: Playbook =
    Playbook { name: "target_down", collectors: NONPOD_SET, interpreter: interpret_target_down };
static K8S_ROLLOUT: Playbook =
    Playbook { name: "k8s_rollout", collectors: FULL_SET, interpreter: interpret_rollout };
static OBSERVABILITY: Playbook = Playbook {
    name: "observability_pipeline",
    collectors: POD_SET,
    interpreter: interpret_observability,
};
static META: Playbook =
    Playbook { name: "meta", collectors: &[CollectorKind::Change], interpreter: interpret_meta };
static BASELINE_POD: Playbook =
    Playbook { name: "baseline_pod", collectors: POD_SET, interpreter: interpret_baseline_pod };
static BASELINE_NONPOD: Playbook = Playbook {
    name: "baseline_nonpod",
    collectors: NONPOD_SET,
    interpreter: interpret_baseline_nonpod,
};

/// Static family registry with the baseline fallback chain: unrecognized
/// pod-scoped targets run `baseline_pod`, everything else
/// `baseline_nonpod`.
pub fn playbook_for(family: Family, identity: &Identity) -> &'static Playbook {
    match family {
        Family::CpuThrottling => &CPU_THROTTLING,
        Family::OomKilled => &OOM_KILLED,
        Family::PodNotHealthy => &POD_NOT_HEALTHY,
        Family::Http5xx => &HTTP_5XX,
        Family::MemoryPressure => &MEMORY_PRESSURE,
        Family::JobFailed => &JOB_FAILED,
        Family::TargetDown => &TARGET_DOWN,
        Family::K8sRollout => &K8S_ROLLOUT,
        Family::ObservabilityPipeline => &OBSERVABILITY,
        Family::Meta => &META,
        Family::Generic => {
            if identity.is_pod_scoped() {
                &BASELINE_POD
            } else {
                &BASELINE_NONPOD
            }
        }
    }
}

/* ============================= SHARED HELPERS ============================= */

fn top_finding(findings: &[Finding]) -> Option<&Finding> {
    findings.iter().max_by_key(|f| f.severity)
}

fn next_from_findings(findings: &[Finding], limit: usize) -> Vec<String> {
    let mut next: Vec<String> = Vec::new();
    let mut ordered: Vec<&Finding> = findings.iter().collect();
    ordered.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.module_id.cmp(&b.module_id)));
    for f in ordered {
        for step in &f.next {
            if !next.contains(step) {
                next.push(step.clone());
            }
            if next.len() >= limit {
                return next;
            }
        }
    }
    next
}

fn hypothesis(
    id: &str,
    root_cause: &str,
    confidence: f64,
    evidence: Vec<String>,
    remediation: Vec<String>,
    unknowns: Vec<String>,
) -> Hypothesis {
    Hypothesis {
        hypothesis_id: id.to_string(),
        root_cause: root_cause.to_string(),
        confidence_0_1: confidence,
        evidence,
        remediation,
        unknowns,
        proposed_actions: Vec::new(),
    }
}

/// Unknowns are preserved verbatim: each unavailable slot becomes an
/// explicit line rather than being silently dropped.
fn unknowns_from_slots(evidence: &Evidence) -> Vec<String> {
    evidence
        .status_lines()
        .into_iter()
        .filter(|line| line.contains("unavailable"))
        .collect()
}

fn fallback_output(input: &PlaybookInput, label: &str) -> PlaybookOutput {
    let mut why = vec![format!("alert {} is firing", input.alert.alertname)];
    why.extend(input.evidence.status_lines());
    let next = next_from_findings(input.findings, 4);
    PlaybookOutput {
        enrichment: Enrichment { label: label.to_string(), why, next },
        hypotheses: Vec::new(),
        verdict: top_finding(input.findings).map(|f| f.label.clone()),
        features: json!({}),
    }
}

/* ============================= INTERPRETERS ============================= */

fn interpret_cpu_throttling(input: &PlaybookInput) -> PlaybookOutput {
    let ratio = input.evidence.metric_latest("cpu_throttle_ratio");
    let usage = input.evidence.metric_latest("cpu_usage_cores");

    let mut why = Vec::new();
    let label;
    let verdict;
    match ratio {
        Some(r) => {
            label = "CPU throttling saturating the target".to_string();
            verdict = Some(format!("CPU throttled {:.1}% of periods", r * 100.0));
            why.push(format!("{:.1}% of CFS periods were throttled", r * 100.0));
            if let Some(u) = usage {
                why.push(format!("usage {:.3} cores against the configured limit", u));
            }
        }
        None => {
            label = "CPU throttling reported, metrics scope unknown".to_string();
            verdict = None;
            why.push("throttle ratio metric is not available".to_string());
        }
    }
    why.extend(unknowns_from_slots(input.evidence));

    let mut next = next_from_findings(input.findings, 3);
    if next.is_empty() {
        next.push(
            "promql: sum(rate(container_cpu_cfs_throttled_periods_total[5m])) by (pod)".to_string(),
        );
    }

    let hypotheses = match ratio {
        Some(r) if r >= 0.25 => vec![hypothesis(
            "hyp-cpu-limit-too-low",
            "CPU limit is below what the workload needs at steady state",
            0.7,
            vec![format!("throttle ratio {:.2}", r)],
            vec!["raise the container CPU limit or remove it in favor of requests".to_string()],
            unknowns_from_slots(input.evidence),
        )],
        _ => Vec::new(),
    };

    PlaybookOutput {
        enrichment: Enrichment { label, why, next },
        hypotheses,
        verdict,
        features: json!({ "cpu": { "throttle_ratio": ratio, "usage_cores": usage } }),
    }
}

fn oom_verdict(input: &PlaybookInput) -> Option<String> {
    input
        .findings
        .iter()
        .find(|f| f.module_id == "oom_killed")
        .map(|f| f.label.clone())
}

fn interpret_oom(input: &PlaybookInput) -> PlaybookOutput {
    let verdict = oom_verdict(input);
    let container = input.evidence.pod().and_then(|p| {
        p.containers
            .iter()
            .find(|c| c.last_terminated.as_ref().is_some_and(|t| t.reason == "OOMKilled"))
    });

    let mut why = Vec::new();
    let label = match (&verdict, container) {
        (Some(v), Some(c)) => {
            why.push(format!("container {} {}", c.name, v));
            if let Some(limit) = c.memory_limit_bytes {
                why.push(format!("memory limit {} bytes", limit));
            }
            if c.restart_count > 0 {
                why.push(format!("{} restarts in the current incarnation", c.restart_count));
            }
            "container killed by the OOM killer".to_string()
        }
        _ => {
            why.push("OOM kill reported but the terminated container state is not visible".to_string());
            "OOM kill reported, container state unknown".to_string()
        }
    };
    why.extend(unknowns_from_slots(input.evidence));

    let peak = input.evidence.metric_latest("memory_working_set_bytes");
    let limit = input
        .evidence
        .metric_latest("memory_limit_bytes")
        .or_else(|| container.and_then(|c| c.memory_limit_bytes.map(|b| b as f64)));

    let confidence = if verdict.is_some() { 0.85 } else { 0.4 };
    let hypotheses = vec![hypothesis(
        "hyp-memory-limit-exceeded",
        "working set grows past the container memory limit",
        confidence,
        match (peak, limit) {
            (Some(p), Some(l)) => vec![format!("peak working set {:.0} of {:.0} limit", p, l)],
            _ => vec!["termination reason OOMKilled".to_string()],
        },
        vec![
            "raise the memory limit after confirming the working set trend".to_string(),
            "check for a leak: compare working set across restarts".to_string(),
        ],
        unknowns_from_slots(input.evidence),
    )];

    PlaybookOutput {
        enrichment: Enrichment {
            label,
            why,
            next: next_from_findings(input.findings, 4),
        },
        hypotheses,
        verdict,
        features: json!({
            "memory": { "peak_working_set_bytes": peak, "limit_bytes": limit }
        }),
    }
}

fn interpret_pod_not_healthy(input: &PlaybookInput) -> PlaybookOutput {
    // OOM dominates: a pod-not-healthy alert whose container was OOMKilled
    // is an OOM incident, not a generic unhealthy pod.
    if input.findings.iter().any(|f| f.module_id == "oom_killed") {
        let mut out = interpret_oom(input);
        out.enrichment.label = format!("pod unhealthy: {}", out.enrichment.label);
        return out;
    }

    let top = top_finding(input.findings);
    let mut why = Vec::new();
    let (label, verdict) = match top {
        Some(f) => {
            why.extend(f.why.clone());
            (format!("pod unhealthy: {}", f.label), Some(f.label.clone()))
        }
        None => {
            why.push("no diagnostic matched the collected evidence".to_string());
            ("pod unhealthy, cause not identified".to_string(), None)
        }
    };
    why.extend(unknowns_from_slots(input.evidence));

    let hypotheses = top
        .map(|f| {
            vec![hypothesis(
                &format!("hyp-{}", f.module_id),
                &f.label,
                match f.severity {
                    FindingSeverity::Critical => 0.8,
                    FindingSeverity::Error => 0.65,
                    _ => 0.4,
                },
                f.why.clone(),
                f.next.clone(),
                unknowns_from_slots(input.evidence),
            )]
        })
        .unwrap_or_default();

    PlaybookOutput {
        enrichment: Enrichment { label, why, next: next_from_findings(input.findings, 4) },
        hypotheses,
        verdict,
        features: json!({
            "pod": {
                "phase": input.evidence.pod().map(|p| p.phase.clone()),
                "restarts": input
                    .evidence
                    .pod()
                    .map(|p| p.containers.iter().map(|c| c.restart_count).max().unwrap_or(0)),
            }
        }),
    }
}

fn interpret_http_5xx(input: &PlaybookInput) -> PlaybookOutput {
    let err = input.evidence.metric_latest("http_5xx_rate");
    let total = input.evidence.metric_latest("http_total_rate");
    let log_5xx = count_kind(input.evidence.parsed_patterns(), PatternKind::HttpStatus5xx);

    let mut why = Vec::new();
    let (label, verdict) = match (err, total) {
        (Some(e), Some(t)) if t > 0.0 => {
            let pct = e / t * 100.0;
            why.push(format!("5xx rate {:.2}/s is {:.1}% of {:.2}/s total", e, pct, t));
            (
                "service returning elevated 5xx responses".to_string(),
                Some(format!("{:.1}% of requests are 5xx", pct)),
            )
        }
        (Some(e), _) => {
            why.push(format!("5xx rate {:.2}/s (total traffic rate unavailable)", e));
            ("service returning 5xx responses".to_string(), Some(format!("5xx at {:.2}/s", e)))
        }
        _ => {
            why.push("5xx metrics are not available; blast radius is unknown".to_string());
            ("5xx reported, metrics scope unavailable".to_string(), None)
        }
    };
    if log_5xx > 0 {
        why.push(format!("{log_5xx} matching 5xx log lines"));
    }
    why.extend(unknowns_from_slots(input.evidence));

    let hypotheses = input
        .findings
        .iter()
        .filter(|f| {
            f.module_id == "connection_refused_pattern" || f.module_id == "recent_deploy_correlation"
        })
        .map(|f| {
            hypothesis(
                &format!("hyp-{}", f.module_id),
                &f.label,
                0.55,
                f.why.clone(),
                f.next.clone(),
                unknowns_from_slots(input.evidence),
            )
        })
        .collect();

    PlaybookOutput {
        enrichment: Enrichment {
            label,
            why,
            next: next_from_findings(input.findings, 4),
        },
        hypotheses,
        verdict,
        features: json!({
            "http": { "rate_5xx": err, "rate_total": total, "log_lines_5xx": log_5xx }
        }),
    }
}

fn interpret_memory_pressure(input: &PlaybookInput) -> PlaybookOutput {
    let used = input.evidence.metric_latest("memory_working_set_bytes");
    let limit = input.evidence.metric_latest("memory_limit_bytes");

    let mut why = Vec::new();
    let (label, verdict) = match (used, limit) {
        (Some(u), Some(l)) if l > 0.0 => {
            let pct = u / l * 100.0;
            why.push(format!("working set at {:.1}% of the memory limit", pct));
            (
                "memory pressure approaching the limit".to_string(),
                Some(format!("memory at {:.1}% of limit", pct)),
            )
        }
        _ => {
            why.push("memory usage or limit metric unavailable".to_string());
            ("memory pressure reported, usage unknown".to_string(), None)
        }
    };
    why.extend(unknowns_from_slots(input.evidence));

    PlaybookOutput {
        enrichment: Enrichment { label, why, next: next_from_findings(input.findings, 3) },
        hypotheses: Vec::new(),
        verdict,
        features: json!({ "memory": { "working_set_bytes": used, "limit_bytes": limit } }),
    }
}

fn interpret_job_failed(input: &PlaybookInput) -> PlaybookOutput {
    let job = input.evidence.job();
    let error_count = count_kind(input.evidence.parsed_patterns(), PatternKind::ErrorPrefix)
        + count_kind(input.evidence.parsed_patterns(), PatternKind::FatalPrefix);
    let exit_reason = input
        .evidence
        .pod()
        .and_then(|p| p.containers.iter().find_map(|c| c.last_terminated.as_ref()))
        .map(|t| format!("{} (exit {})", t.reason, t.exit_code))
        .or_else(|| job.and_then(|j| j.failure_reason.clone()));

    let mut why = Vec::new();
    let (label, verdict) = match job {
        Some(j) => {
            why.push(format!(
                "job {} failed {} of {} allowed attempts",
                j.name,
                j.failed,
                j.backoff_limit + 1
            ));
            if let Some(reason) = &exit_reason {
                why.push(format!("last exit: {reason}"));
            }
            (
                "job failed".to_string(),
                Some(match &exit_reason {
                    Some(r) => format!("job {} failed: {r}", j.name),
                    None => format!("job {} failed", j.name),
                }),
            )
        }
        None => {
            why.push("job object not visible; it may have been cleaned up".to_string());
            ("job failed, job object missing".to_string(), None)
        }
    };

    if let Some(logs) = input.evidence.logs.get() {
        if logs.historical_fallback {
            why.push("pod was garbage-collected; logs recovered via pod-name-prefix search".to_string());
        }
        if let Some(first_error) = logs
            .parsed_patterns
            .iter()
            .find(|p| matches!(p.pattern_kind, PatternKind::ErrorPrefix | PatternKind::FatalPrefix))
        {
            why.push(format!("first error: {}", first_error.representative_line));
        }
    }
    why.extend(unknowns_from_slots(input.evidence));

    let mut next = next_from_findings(input.findings, 3);
    if let Some(j) = job {
        let cmd = format!(
            "kubectl logs -n {} -l job-name={} --tail=200",
            j.namespace, j.name
        );
        if !next.contains(&cmd) {
            next.push(cmd);
        }
    }

    PlaybookOutput {
        enrichment: Enrichment { label, why, next },
        hypotheses: Vec::new(),
        verdict,
        features: json!({
            "job_metrics": {
                "attempts": job.map(|j| j.failed + j.succeeded),
                "backoff_limit": job.map(|j| j.backoff_limit),
                "exit_reason": exit_reason,
                "error_count": error_count,
            }
        }),
    }
}

fn interpret_target_down(input: &PlaybookInput) -> PlaybookOutput {
    let scrape_up = input.evidence.metric_latest("scrape_up");
    let mut why = vec![format!(
        "scrape target for {} is down",
        input.alert.label("job").unwrap_or("<job>")
    )];
    if scrape_up == Some(0.0) {
        why.push("the `up` series for the target reads 0".to_string());
    }
    why.extend(input.evidence.status_lines());

    let mut next = next_from_findings(input.findings, 4);
    for step in [
        "curl -sS http://<target>/metrics | head".to_string(),
        "kubectl get endpoints -A | grep <job>".to_string(),
    ] {
        if !next.contains(&step) {
            next.push(step);
        }
    }

    PlaybookOutput {
        enrichment: Enrichment {
            label: "scrape target unreachable".to_string(),
            why,
            next,
        },
        hypotheses: Vec::new(),
        verdict: Some("scrape target down".to_string()),
        features: json!({ "scrape": { "up": scrape_up } }),
    }
}

fn interpret_rollout(input: &PlaybookInput) -> PlaybookOutput {
    let mut out = fallback_output(input, "rollout degraded");
    if let Some(w) = input.evidence.workload() {
        out.enrichment.why.insert(
            0,
            format!(
                "{} at {}/{} available replicas",
                w.workload.key(),
                w.replicas_available,
                w.replicas_desired
            ),
        );
        out.verdict = Some(format!(
            "{}/{} replicas available",
            w.replicas_available, w.replicas_desired
        ));
    }
    out
}

fn interpret_observability(input: &PlaybookInput) -> PlaybookOutput {
    let mut out = fallback_output(input, "observability component degraded");
    out.enrichment.why.insert(
        0,
        "an observability-pipeline component is unhealthy; alert visibility may be reduced"
            .to_string(),
    );
    out
}

fn interpret_meta(input: &PlaybookInput) -> PlaybookOutput {
    PlaybookOutput {
        enrichment: Enrichment {
            label: "meta alert".to_string(),
            why: vec![format!(
                "{} is a pipeline-health alert, not an incident",
                input.alert.alertname
            )],
            next: Vec::new(),
        },
        hypotheses: Vec::new(),
        verdict: Some("meta / pipeline-health alert".to_string()),
        features: json!({}),
    }
}

fn interpret_baseline_pod(input: &PlaybookInput) -> PlaybookOutput {
    fallback_output(input, "pod-scoped alert without a dedicated playbook")
}

fn interpret_baseline_nonpod(input: &PlaybookInput) -> PlaybookOutput {
    fallback_output(input, "non-pod alert without a dedicated playbook")
}

/* ============================= COLLECTOR NEEDS ============================= */

impl Playbook {
    pub fn wants(&self, kind: CollectorKind) -> bool {
        self.collectors.contains(&kind)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{
        ContainerSnapshot, ContainerState, JobSnapshot, K8sEvidence, LogsEvidence, PodSnapshot,
        Slot, TerminationRecord,
    };
    use crate::model::AlertStatus;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn alert(name: &str) -> AlertInstance {
        AlertInstance {
            fingerprint: "f".into(),
            alertname: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
            ends_at: None,
            status: AlertStatus::Firing,
        }
    }

    fn pod_identity() -> Identity {
        Identity::Pod { cluster: "main".into(), namespace: "prod".into(), pod: "web-abc".into() }
    }

    #[test]
    fn test_fallback_routes_by_scope() {
        assert_eq!(playbook_for(Family::Generic, &pod_identity()).name, "baseline_pod");
        assert_eq!(playbook_for(Family::Generic, &Identity::Unknown).name, "baseline_nonpod");
        assert_eq!(
            playbook_for(Family::Generic, &Identity::NonPod { labels: BTreeMap::new() }).name,
            "baseline_nonpod"
        );
    }

    #[test]
    fn test_every_family_has_a_playbook() {
        for family in [
            Family::CpuThrottling,
            Family::OomKilled,
            Family::PodNotHealthy,
            Family::Http5xx,
            Family::MemoryPressure,
            Family::JobFailed,
            Family::TargetDown,
            Family::K8sRollout,
            Family::ObservabilityPipeline,
            Family::Meta,
            Family::Generic,
        ] {
            let pb = playbook_for(family, &pod_identity());
            assert!(!pb.name.is_empty());
            assert!(!pb.collectors.is_empty());
        }
    }

    #[test]
    fn test_oom_interpreter_builds_verdict_from_finding() {
        let mut ev = Evidence::pending(false, false);
        ev.k8s = Slot::ok(K8sEvidence {
            pod: Some(PodSnapshot {
                name: "web-abc".into(),
                namespace: "prod".into(),
                phase: "Running".into(),
                node: None,
                conditions: vec![],
                containers: vec![ContainerSnapshot {
                    name: "app".into(),
                    image: "web:v1".into(),
                    ready: false,
                    restart_count: 15,
                    state: ContainerState::Waiting { reason: "CrashLoopBackOff".into() },
                    last_terminated: Some(TerminationRecord {
                        reason: "OOMKilled".into(),
                        exit_code: 137,
                        finished_at: None,
                    }),
                    memory_limit_bytes: Some(512 * 1024 * 1024),
                    cpu_limit_millis: None,
                }],
                init_containers: vec![],
                owner: None,
                created_at: None,
                deleted: false,
            }),
            workload: None,
            job: None,
            events: vec![],
        });

        let findings = crate::diagnostics::run_all(&ev);
        let a = alert("KubernetesPodNotHealthy");
        let id = pod_identity();
        let input = PlaybookInput {
            alert: &a,
            identity: &id,
            family: Family::PodNotHealthy,
            evidence: &ev,
            findings: &findings,
        };
        let out = interpret_pod_not_healthy(&input);
        assert!(out.verdict.as_deref().unwrap().contains("OOMKilled (exit 137)"));
        assert!(!out.hypotheses.is_empty());
    }

    #[test]
    fn test_job_failed_features_shape() {
        let mut ev = Evidence::pending(false, false);
        ev.k8s = Slot::ok(K8sEvidence {
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
        ev.logs = Slot::ok(LogsEvidence {
            backend: "loki".into(),
            query: "q".into(),
            entries: vec![],
            parsed_patterns: crate::logparse::parse_entries(&[crate::evidence::LogEntry {
                timestamp: None,
                line: "ERROR: sync exploded".into(),
            }]),
            historical_fallback: true,
        });

        let a = alert("KubeJobFailed");
        let id = Identity::Job {
            cluster: "main".into(),
            namespace: "batch".into(),
            job: "nightly-sync".into(),
        };
        let findings = crate::diagnostics::run_all(&ev);
        let input = PlaybookInput {
            alert: &a,
            identity: &id,
            family: Family::JobFailed,
            evidence: &ev,
            findings: &findings,
        };
        let out = interpret_job_failed(&input);
        let jm = &out.features["job_metrics"];
        assert_eq!(jm["attempts"], 4);
        assert_eq!(jm["backoff_limit"], 3);
        assert_eq!(jm["error_count"], 1);
        assert!(out.enrichment.why.iter().any(|w| w.contains("pod-name-prefix")));
    }

    #[test]
    fn test_interpreters_are_deterministic() {
        let ev = Evidence::pending(false, false);
        let a = alert("SomethingOdd");
        let id = pod_identity();
        let findings: Vec<Finding> = vec![];
        let input = PlaybookInput {
            alert: &a,
            identity: &id,
            family: Family::Generic,
            evidence: &ev,
            findings: &findings,
        };
        let pb = playbook_for(Family::Generic, &id);
        assert_eq!((pb.interpreter)(&input), (pb.interpreter)(&input));
    }

    #[test]
    fn test_unknowns_preserved_in_enrichment() {
        let ev = Evidence::pending(false, false);
        let a = alert("SomethingOdd");
        let id = pod_identity();
        let findings: Vec<Finding> = vec![];
        let input = PlaybookInput {
            alert: &a,
            identity: &id,
            family: Family::Generic,
            evidence: &ev,
            findings: &findings,
        };
        let out = interpret_baseline_pod(&input);
        assert!(
            out.enrichment
                .why
                .iter()
                .any(|w| w.contains("unavailable (not_collected)")),
            "unavailable slots must appear verbatim: {:?}",
            out.enrichment.why
        );
    }
}
