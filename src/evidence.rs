use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logparse::ParsedPattern;

/* ============================= SLOTS ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SlotStatus {
    Ok,
    Empty,
    Unavailable { reason: String },
}

impl SlotStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SlotStatus::Ok)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SlotStatus::Unavailable { reason } => Some(reason),
            _ => None,
        }
    }

    /// Short display form: `ok`, `empty`, or `unavailable (<reason>)`.
    pub fn describe(&self) -> String {
        match self {
            SlotStatus::Ok => "ok".to_string(),
            SlotStatus::Empty => "empty".to_string(),
            SlotStatus::Unavailable { reason } => format!("unavailable ({reason})"),
        }
    }
}

/// One typed evidence slot. Absence never looks like presence: a slot
/// without data always says whether it was empty or unavailable, and
/// unavailable always carries a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot<T> {
    pub status: SlotStatus,
    pub data: Option<T>,
}

impl<T> Slot<T> {
    pub fn ok(data: T) -> Slot<T> {
        Slot { status: SlotStatus::Ok, data: Some(data) }
    }

    pub fn empty() -> Slot<T> {
        Slot { status: SlotStatus::Empty, data: None }
    }

    pub fn unavailable(reason: impl Into<String>) -> Slot<T> {
        Slot {
            status: SlotStatus::Unavailable { reason: reason.into() },
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn get(&self) -> Option<&T> {
        self.data.as_ref()
    }
}

/* ============================= K8S ============================= */

/// Parent workload reference (Deployment, StatefulSet, DaemonSet, or Job).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl WorkloadRef {
    /// Canonical key: "kind/namespace/name".
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.kind.to_lowercase(), self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Waiting { reason: String },
    Terminated { reason: String, exit_code: i32 },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub reason: String,
    pub exit_code: i32,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub name: String,
    pub image: String,
    pub ready: bool,
    pub restart_count: i32,
    pub state: ContainerState,
    pub last_terminated: Option<TerminationRecord>,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_limit_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodCondition {
    pub condition_type: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node: Option<String>,
    pub conditions: Vec<PodCondition>,
    pub containers: Vec<ContainerSnapshot>,
    pub init_containers: Vec<ContainerSnapshot>,
    pub owner: Option<WorkloadRef>,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub workload: WorkloadRef,
    pub replicas_desired: i32,
    pub replicas_ready: i32,
    pub replicas_available: i32,
    pub image: Option<String>,
    pub last_rollout_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub name: String,
    pub namespace: String,
    pub attempts: i32,
    pub backoff_limit: i32,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub completion_deadline_seconds: Option<i64>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub count: i32,
    pub last_seen: Option<DateTime<Utc>>,
    pub object: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K8sEvidence {
    pub pod: Option<PodSnapshot>,
    pub workload: Option<WorkloadSnapshot>,
    pub job: Option<JobSnapshot>,
    pub events: Vec<EventSnapshot>,
}

/* ============================= METRICS ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub query: String,
    /// (unix seconds, value) samples in ascending time order.
    pub points: Vec<(i64, f64)>,
    pub latest: Option<f64>,
}

/// Named PromQL results keyed by a stable series name so producers can run
/// in any order without changing the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvidence {
    pub series: BTreeMap<String, MetricSeries>,
}

/* ============================= LOGS ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsEvidence {
    pub backend: String,
    pub query: String,
    pub entries: Vec<LogEntry>,
    pub parsed_patterns: Vec<ParsedPattern>,
    /// True when the entries came from the historical pod-prefix fallback
    /// rather than a live-pod query.
    pub historical_fallback: bool,
}

/* ============================= AWS ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudTrailEvent {
    pub event_name: String,
    pub event_time: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub resources: Vec<String>,
}

/// AWS evidence keeps one slot per subsystem so a single throttled API
/// does not hide the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsEvidence {
    pub subsystems: BTreeMap<String, Slot<serde_json::Value>>,
    pub cloudtrail: Slot<Vec<CloudTrailEvent>>,
}

/* ============================= GITHUB ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub head_sha: String,
    pub created_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub run_id: Option<u64>,
    /// Failed job names (with first failed step) for failed runs.
    pub failed_jobs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubEvidence {
    pub repo: String,
    pub commits: Vec<CommitInfo>,
    pub workflow_runs: Vec<WorkflowRun>,
}

/* ============================= CHANGE ============================= */

/// Recent-change signals correlated across K8s events, CloudTrail, and
/// GitHub within the lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSignals {
    pub summary: Option<String>,
    pub last_change_time: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub signals: Vec<String>,
}

/* ============================= EVIDENCE RECORD ============================= */

/// The full evidence record seen by every pipeline stage. Slots start
/// unavailable and are filled by collectors; the shape never changes, so
/// later stages always observe either data or an explicit marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub k8s: Slot<K8sEvidence>,
    pub metrics: Slot<MetricsEvidence>,
    pub logs: Slot<LogsEvidence>,
    pub aws: Option<Slot<AwsEvidence>>,
    pub github: Option<Slot<GithubEvidence>>,
    pub change: Slot<ChangeSignals>,
}

pub const REASON_NOT_COLLECTED: &str = "not_collected";

impl Evidence {
    /// Fresh record with every slot marked unavailable. The aws/github
    /// slots are absent entirely when those providers are disabled.
    pub fn pending(aws_enabled: bool, github_enabled: bool) -> Evidence {
        Evidence {
            k8s: Slot::unavailable(REASON_NOT_COLLECTED),
            metrics: Slot::unavailable(REASON_NOT_COLLECTED),
            logs: Slot::unavailable(REASON_NOT_COLLECTED),
            aws: aws_enabled.then(|| Slot::unavailable(REASON_NOT_COLLECTED)),
            github: github_enabled.then(|| Slot::unavailable(REASON_NOT_COLLECTED)),
            change: Slot::unavailable(REASON_NOT_COLLECTED),
        }
    }

    pub fn pod(&self) -> Option<&PodSnapshot> {
        self.k8s.get().and_then(|k| k.pod.as_ref())
    }

    pub fn workload(&self) -> Option<&WorkloadSnapshot> {
        self.k8s.get().and_then(|k| k.workload.as_ref())
    }

    pub fn job(&self) -> Option<&JobSnapshot> {
        self.k8s.get().and_then(|k| k.job.as_ref())
    }

    pub fn events(&self) -> &[EventSnapshot] {
        self.k8s.get().map(|k| k.events.as_slice()).unwrap_or(&[])
    }

    pub fn has_event_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }

    /// Latest value of a named metric series, if collected.
    pub fn metric_latest(&self, name: &str) -> Option<f64> {
        self.metrics.get().and_then(|m| m.series.get(name)).and_then(|s| s.latest)
    }

    pub fn parsed_patterns(&self) -> &[ParsedPattern] {
        self.logs
            .get()
            .map(|l| l.parsed_patterns.as_slice())
            .unwrap_or(&[])
    }

    /// One `name=status` line per slot, in fixed order; the report and
    /// playbook interpreters surface these verbatim.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("k8s={}", self.k8s.status.describe()),
            format!("metrics={}", self.metrics.status.describe()),
            format!("logs={}", self.logs.status.describe()),
        ];
        if let Some(aws) = &self.aws {
            lines.push(format!("aws={}", aws.status.describe()));
        }
        if let Some(github) = &self.github {
            lines.push(format!("github={}", github.status.describe()));
        }
        lines.push(format!("change={}", self.change.status.describe()));
        lines
    }

}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_always_carries_reason() {
        let slot: Slot<K8sEvidence> = Slot::unavailable("timeout");
        assert_eq!(slot.status.reason(), Some("timeout"));
        assert!(slot.data.is_none());
    }

    #[test]
    fn test_empty_slot_has_no_data() {
        let slot: Slot<LogsEvidence> = Slot::empty();
        assert_eq!(slot.status, SlotStatus::Empty);
        assert!(slot.data.is_none());
    }

    #[test]
    fn test_pending_shape_respects_feature_flags() {
        let ev = Evidence::pending(false, false);
        assert!(ev.aws.is_none());
        assert!(ev.github.is_none());

        let ev = Evidence::pending(true, true);
        assert!(ev.aws.is_some());
        assert!(ev.github.is_some());
    }

    #[test]
    fn test_status_describe_forms() {
        assert_eq!(SlotStatus::Ok.describe(), "ok");
        assert_eq!(SlotStatus::Empty.describe(), "empty");
        assert_eq!(
            SlotStatus::Unavailable { reason: "http_error:503".into() }.describe(),
            "unavailable (http_error:503)"
        );
    }

    #[test]
    fn test_slot_serde_round_trip() {
        let slot = Slot::ok(MetricsEvidence { series: Default::default() });
        let json = serde_json::to_string(&slot).unwrap();
        let back: Slot<MetricsEvidence> = serde_json::from_str(&json).unwrap();
        assert_eq!(slot, back);
    }
}
