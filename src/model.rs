use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::evidence::{ChangeSignals, Evidence};

/* ============================= LABEL KEYS ============================= */

pub const LABEL_NAMESPACE: &str = "namespace";
pub const LABEL_POD: &str = "pod";
pub const LABEL_CONTAINER: &str = "container";
pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_SEVERITY: &str = "severity";
pub const LABEL_TEAM: &str = "team";
pub const LABEL_JOB_NAME: &str = "job_name";
pub const LABEL_JOB: &str = "job";
pub const LABEL_WORKLOAD: &str = "workload";

/// Labels that vary per pod/scrape and must not contribute to a non-pod
/// identity.
const EPHEMERAL_LABELS: &[&str] = &["pod", "instance", "endpoint", "pod_ip", "uid"];

/// Labels that describe the alert rather than a target; an alert whose
/// stable labels are all of this kind has no identity (Scenario A).
const NON_TARGET_LABELS: &[&str] =
    &["alertname", "alertgroup", "alertstate", "severity", "team", "prometheus"];

/// Alertnames that churn during rollouts and are deduplicated at the
/// owning-workload level with a freshness gate.
pub const ROLLOUT_NOISY_ALERTNAMES: &[&str] =
    &["KubernetesPodNotHealthy", "KubernetesContainerOomKiller"];

/// Seconds per dedup bucket: reports for the same incident within one
/// bucket share an artifact key.
pub const DEDUP_BUCKET_SECONDS: i64 = 4 * 3600;

/// Rollout-noisy identities get at most one run per freshness window.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(3600);

/* ============================= ALERT ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// One alert as received from Alertmanager. Immutable after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub fingerprint: String,
    pub alertname: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub status: AlertStatus,
}

impl AlertInstance {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.label(LABEL_NAMESPACE)
    }

    pub fn pod(&self) -> Option<&str> {
        self.label(LABEL_POD)
    }

    pub fn container(&self) -> Option<&str> {
        self.label(LABEL_CONTAINER)
    }

    pub fn severity(&self) -> Option<&str> {
        self.label(LABEL_SEVERITY)
    }

    pub fn team(&self) -> Option<&str> {
        self.label(LABEL_TEAM)
    }
}

/* ============================= IDENTITY ============================= */

/// Canonical target tuple derived from alert labels. The identity is the
/// stable half of the dedup key: one logical incident maps to one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Identity {
    Pod {
        cluster: String,
        namespace: String,
        pod: String,
    },
    Workload {
        cluster: String,
        namespace: String,
        kind: String,
        owner: String,
    },
    Job {
        cluster: String,
        namespace: String,
        job: String,
    },
    NonPod {
        labels: BTreeMap<String, String>,
    },
    /// Scenario A: the alert carries no usable target labels.
    Unknown,
}

impl Identity {
    /// Derive an identity from alert labels. Rollout-noisy alerts are
    /// re-scoped to their owning workload later, in the pipeline's resolve
    /// stage, once ownerReferences are available.
    pub fn from_alert(alert: &AlertInstance, cluster: &str) -> Identity {
        let cluster = alert.label(LABEL_CLUSTER).unwrap_or(cluster).to_string();

        if alert.alertname.contains("Job") {
            if let (Some(ns), Some(job)) = (
                alert.namespace(),
                alert.label(LABEL_JOB_NAME).or_else(|| alert.label(LABEL_JOB)),
            ) {
                return Identity::Job {
                    cluster,
                    namespace: ns.to_string(),
                    job: job.to_string(),
                };
            }
        }

        if let (Some(ns), Some(pod)) = (alert.namespace(), alert.pod()) {
            return Identity::Pod {
                cluster,
                namespace: ns.to_string(),
                pod: pod.to_string(),
            };
        }

        if let (Some(ns), Some(workload)) = (alert.namespace(), alert.label(LABEL_WORKLOAD)) {
            return Identity::Workload {
                cluster,
                namespace: ns.to_string(),
                kind: "Deployment".to_string(),
                owner: workload.to_string(),
            };
        }

        let stable: BTreeMap<String, String> = alert
            .labels
            .iter()
            .filter(|(k, _)| !EPHEMERAL_LABELS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let has_target = stable
            .keys()
            .any(|k| !NON_TARGET_LABELS.contains(&k.as_str()));
        if has_target {
            Identity::NonPod { labels: stable }
        } else {
            Identity::Unknown
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Identity::Pod { namespace, .. }
            | Identity::Workload { namespace, .. }
            | Identity::Job { namespace, .. } => Some(namespace),
            Identity::NonPod { labels } => labels.get(LABEL_NAMESPACE).map(String::as_str),
            Identity::Unknown => None,
        }
    }

    pub fn pod_name(&self) -> Option<&str> {
        match self {
            Identity::Pod { pod, .. } => Some(pod),
            _ => None,
        }
    }

    pub fn is_pod_scoped(&self) -> bool {
        matches!(self, Identity::Pod { .. } | Identity::Workload { .. } | Identity::Job { .. })
    }

    /// Canonical string form, used for hashing and display.
    pub fn canonical(&self) -> String {
        match self {
            Identity::Pod { cluster, namespace, pod } => {
                format!("pod/{cluster}/{namespace}/{pod}")
            }
            Identity::Workload { cluster, namespace, kind, owner } => {
                format!("workload/{cluster}/{namespace}/{}/{owner}", kind.to_lowercase())
            }
            Identity::Job { cluster, namespace, job } => {
                format!("job/{cluster}/{namespace}/{job}")
            }
            Identity::NonPod { labels } => {
                let pairs: Vec<String> =
                    labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!("nonpod/{}", pairs.join(","))
            }
            Identity::Unknown => "unknown".to_string(),
        }
    }

    /// Stable 12-hex-char digest of the canonical form; part of the
    /// artifact key contract.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..12].to_string()
    }
}

/* ============================= FAMILY ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    CpuThrottling,
    OomKilled,
    PodNotHealthy,
    Http5xx,
    MemoryPressure,
    JobFailed,
    TargetDown,
    K8sRollout,
    ObservabilityPipeline,
    Meta,
    Generic,
}

impl Family {
    /// Infer the family from the alertname (primary) and labels (fallback).
    pub fn infer(alert: &AlertInstance) -> Family {
        let name = alert.alertname.as_str();
        let lower = name.to_lowercase();

        if name == "CPUThrottlingHigh" || lower.contains("throttl") {
            return Family::CpuThrottling;
        }
        if lower.contains("oomkill") || lower.contains("oom_kill") {
            return Family::OomKilled;
        }
        if name == "KubernetesPodNotHealthy"
            || lower.contains("podnothealthy")
            || lower.contains("crashloop")
            || lower.contains("podnotready")
        {
            return Family::PodNotHealthy;
        }
        if lower.contains("5xx") || lower.contains("httperror") {
            return Family::Http5xx;
        }
        if lower.contains("memorypressure") || lower.contains("memoryhigh") {
            return Family::MemoryPressure;
        }
        if lower.contains("jobfailed") || lower.contains("jobcompletion") {
            return Family::JobFailed;
        }
        if name == "TargetDown" || lower.contains("targetdown") {
            return Family::TargetDown;
        }
        if lower.contains("rollout") || lower.contains("replicasmismatch") {
            return Family::K8sRollout;
        }
        if lower.contains("loki")
            || lower.contains("prometheus")
            || lower.contains("alertmanager")
            || lower.contains("victoria")
        {
            return Family::ObservabilityPipeline;
        }
        if name == "Watchdog" || name == "InfoInhibitor" {
            return Family::Meta;
        }
        Family::Generic
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::CpuThrottling => "cpu_throttling",
            Family::OomKilled => "oom_killed",
            Family::PodNotHealthy => "pod_not_healthy",
            Family::Http5xx => "http_5xx",
            Family::MemoryPressure => "memory_pressure",
            Family::JobFailed => "job_failed",
            Family::TargetDown => "target_down",
            Family::K8sRollout => "k8s_rollout",
            Family::ObservabilityPipeline => "observability_pipeline",
            Family::Meta => "meta",
            Family::Generic => "generic",
        }
    }
}

/// True for alertnames that churn during rollouts; these are re-scoped to
/// the owning workload and rate-limited by the freshness gate.
pub fn is_rollout_noisy(alertname: &str, extra: &[String]) -> bool {
    ROLLOUT_NOISY_ALERTNAMES.contains(&alertname)
        || extra.iter().any(|a| a == alertname)
}

/* ============================= TIME WINDOW ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window ending at the alert start, spanning `window` backwards.
    pub fn ending_at(end: DateTime<Utc>, window: Duration) -> TimeWindow {
        TimeWindow {
            start: end - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1)),
            end,
        }
    }
}

/// Bucket index for artifact-key stability: `floor(unix_seconds / 4h)`.
pub fn dedup_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(DEDUP_BUCKET_SECONDS)
}

/* ============================= JOB ============================= */

/// Durable queue payload: everything a worker needs to run one
/// investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationJob {
    pub identity: Identity,
    pub family: Family,
    pub alert: AlertInstance,
    pub window: TimeWindow,
    pub dedup_bucket: i64,
    /// Set by the freshness gate: an older artifact exists and must be
    /// overwritten rather than skipped.
    pub overwrite: bool,
}

impl InvestigationJob {
    /// Queue message id; JetStream's duplicate window keys on this.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.identity.hash(),
            self.family.as_str(),
            self.dedup_bucket
        )
    }
}

/* ============================= FINDINGS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// Deterministic output of one diagnostic module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub module_id: String,
    pub severity: FindingSeverity,
    pub label: String,
    pub why: Vec<String>,
    pub next: Vec<String>,
    pub evidence_refs: Vec<String>,
}

/* ============================= HYPOTHESES ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub hypothesis_id: String,
    pub root_cause: String,
    pub confidence_0_1: f64,
    pub evidence: Vec<String>,
    pub remediation: Vec<String>,
    pub unknowns: Vec<String>,
    pub proposed_actions: Vec<String>,
}

/* ============================= SCORES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Actionable,
    Informational,
    Noisy,
    Artifact,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Actionable => "actionable",
            Classification::Informational => "informational",
            Classification::Noisy => "noisy",
            Classification::Artifact => "artifact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub impact: u8,
    pub confidence: u8,
    pub noise: u8,
    pub classification: Classification,
}

/* ============================= BLOCKED SCENARIOS ============================= */

/// Missing-evidence conditions the pipeline must acknowledge honestly
/// rather than paper over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedScenario {
    /// A: the alert carries no usable target identity.
    TargetIdentityMissing,
    /// B: the Kubernetes API is unavailable.
    K8sUnavailable,
    /// C: logs could not be fetched (distinct from logs being empty).
    LogsUnavailable,
    /// D: the metrics scope is unavailable, so blast radius is unknown.
    MetricsUnavailable,
}

/* ============================= ANALYSIS ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub label: String,
    pub why: Vec<String>,
    pub next: Vec<String>,
}

/// Playbook interpreter output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub label: String,
    pub why: Vec<String>,
    pub next: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmEnrichment {
    pub status: String,
    pub summary: Option<String>,
    pub likely_root_cause: Option<String>,
    pub confidence: Option<f64>,
    pub next_steps: Vec<String>,
}

/// Composite analysis for one run. Every field is serialized even when
/// null so downstream consumers always see the full shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub decision: Decision,
    pub enrichment: Option<Enrichment>,
    pub features: serde_json::Value,
    pub verdict: Option<String>,
    pub hypotheses: Vec<Hypothesis>,
    pub rca: Option<String>,
    pub scores: Scores,
    pub change: Option<ChangeSignals>,
    pub blocked: Vec<BlockedScenario>,
    pub stage_errors: Vec<String>,
    pub llm: Option<LlmEnrichment>,
}

/* ============================= INVESTIGATION ============================= */

/// One pipeline execution. The case is stable across runs of the same
/// (identity, family); the run is unique per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investigation {
    pub case_id: String,
    pub run_id: String,
    pub alert: AlertInstance,
    pub identity: Identity,
    pub family: Family,
    pub evidence: Evidence,
    pub analysis: Analysis,
    pub report_markdown: String,
    pub report_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Case ids are derived, not generated: the same incident always maps to
/// the same case.
pub fn case_id(identity: &Identity, family: Family) -> String {
    format!("case-{}-{}", identity.hash(), family.as_str())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alert_with(labels: &[(&str, &str)], name: &str) -> AlertInstance {
        AlertInstance {
            fingerprint: "f1".into(),
            alertname: name.into(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            annotations: BTreeMap::new(),
            starts_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
            ends_at: None,
            status: AlertStatus::Firing,
        }
    }

    #[test]
    fn test_identity_pod_scoped() {
        let a = alert_with(&[("namespace", "prod"), ("pod", "web-abc")], "CPUThrottlingHigh");
        let id = Identity::from_alert(&a, "main");
        assert_eq!(
            id,
            Identity::Pod {
                cluster: "main".into(),
                namespace: "prod".into(),
                pod: "web-abc".into()
            }
        );
    }

    #[test]
    fn test_identity_job_scoped_prefers_job_name() {
        let a = alert_with(
            &[("namespace", "batch"), ("job_name", "nightly-sync"), ("job", "kube-state-metrics")],
            "KubeJobFailed",
        );
        let id = Identity::from_alert(&a, "main");
        assert_eq!(
            id,
            Identity::Job {
                cluster: "main".into(),
                namespace: "batch".into(),
                job: "nightly-sync".into()
            }
        );
    }

    #[test]
    fn test_identity_unknown_when_no_labels() {
        let a = alert_with(&[], "SomethingBroke");
        assert_eq!(Identity::from_alert(&a, "main"), Identity::Unknown);

        // Alert-describing labels alone do not make a target.
        let a = alert_with(&[("alertname", "SomethingBroke"), ("severity", "critical")], "SomethingBroke");
        assert_eq!(Identity::from_alert(&a, "main"), Identity::Unknown);
    }

    #[test]
    fn test_identity_nonpod_strips_ephemeral_labels() {
        let a = alert_with(
            &[("instance", "10.0.0.1:9100"), ("severity", "warning"), ("node", "n1")],
            "NodeDiskPressure",
        );
        match Identity::from_alert(&a, "main") {
            Identity::NonPod { labels } => {
                assert!(!labels.contains_key("instance"));
                assert!(labels.contains_key("node"));
            }
            other => panic!("expected NonPod, got {other:?}"),
        }
    }

    #[test]
    fn test_identity_hash_is_stable() {
        let a = alert_with(&[("namespace", "prod"), ("pod", "web-abc")], "CPUThrottlingHigh");
        let id1 = Identity::from_alert(&a, "main");
        let id2 = Identity::from_alert(&a, "main");
        assert_eq!(id1.hash(), id2.hash());
        assert_eq!(id1.hash().len(), 12);
    }

    #[test]
    fn test_family_inference() {
        for (name, family) in [
            ("CPUThrottlingHigh", Family::CpuThrottling),
            ("KubernetesContainerOomKiller", Family::OomKilled),
            ("KubernetesPodNotHealthy", Family::PodNotHealthy),
            ("Http5xxRateHigh", Family::Http5xx),
            ("KubeJobFailed", Family::JobFailed),
            ("TargetDown", Family::TargetDown),
            ("Watchdog", Family::Meta),
            ("SomethingElse", Family::Generic),
        ] {
            let a = alert_with(&[], name);
            assert_eq!(Family::infer(&a), family, "alertname {name}");
        }
    }

    #[test]
    fn test_dedup_bucket_floors_to_four_hours() {
        let t1 = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 7, 1, 3, 59, 59).unwrap();
        let t3 = Utc.with_ymd_and_hms(2026, 7, 1, 4, 0, 0).unwrap();
        assert_eq!(dedup_bucket(t1), dedup_bucket(t2));
        assert_eq!(dedup_bucket(t3), dedup_bucket(t1) + 1);
    }

    #[test]
    fn test_rollout_noisy_set() {
        assert!(is_rollout_noisy("KubernetesPodNotHealthy", &[]));
        assert!(is_rollout_noisy("KubernetesContainerOomKiller", &[]));
        assert!(!is_rollout_noisy("CPUThrottlingHigh", &[]));
        assert!(is_rollout_noisy("Http5xxRateHigh", &["Http5xxRateHigh".to_string()]));
    }

    #[test]
    fn test_case_id_stable_across_runs() {
        let a = alert_with(&[("namespace", "prod"), ("pod", "web-abc")], "CPUThrottlingHigh");
        let id = Identity::from_alert(&a, "main");
        assert_eq!(
            case_id(&id, Family::CpuThrottling),
            case_id(&id, Family::CpuThrottling)
        );
    }
}
