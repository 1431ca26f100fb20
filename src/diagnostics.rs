//! Diagnostic modules.
//!
//! Each module is a pure failure-mode detector: `applies` gates on the
//! evidence shape, `run` emits at most one finding. No I/O. Registration
//! is static and the registry is ordered by module id, so a given evidence
//! record always produces the same findings in the same order.

use crate::evidence::{ContainerState, Evidence, SlotStatus};
use crate::logparse::{PatternKind, count_kind};
use crate::model::{Finding, FindingSeverity};

/* ============================= TRAIT & REGISTRY ============================= */

pub trait Diagnostic: Send + Sync {
    fn id(&self) -> &'static str;
    fn applies(&self, evidence: &Evidence) -> bool;
    fn run(&self, evidence: &Evidence) -> Option<Finding>;
}

/// All registered modules, ordered by id.
pub fn registry() -> Vec<Box<dyn Diagnostic>> {
    let mut modules: Vec<Box<dyn Diagnostic>> = vec![
        Box::new(CloudtrailRecentChange),
        Box::new(ConnectionRefusedPattern),
        Box::new(ContainerCreateConfigError),
        Box::new(CpuThrottleSaturation),
        Box::new(CrashLoopBackOff),
        Box::new(EbsThrottling),
        Box::new(EcrImageMissing),
        Box::new(ElbUnhealthyTargets),
        Box::new(ErrImagePull),
        Box::new(ErrorLogSurge),
        Box::new(FatalLogPattern),
        Box::new(Http5xxSpike),
        Box::new(ImagePullBackOff),
        Box::new(InitContainerFailing),
        Box::new(JobBackoffLimitExceeded),
        Box::new(JobDeadlineExceeded),
        Box::new(LivenessProbeFailing),
        Box::new(MemoryNearLimit),
        Box::new(NatGatewayUnreachable),
        Box::new(NodePressureEviction),
        Box::new(OomKilled),
        Box::new(PodPendingUnschedulable),
        Box::new(ReadinessProbeFailing),
        Box::new(RecentDeployCorrelation),
        Box::new(ReplicaUnavailable),
        Box::new(RolloutStuck),
        Box::new(SecurityGroupBlocked),
        Box::new(ServiceAccountForbidden),
        Box::new(StackTracePresent),
        Box::new(TargetScrapeDown),
        Box::new(TimeoutPattern),
        Box::new(VolumeMountFailure),
    ];
    modules.sort_by_key(|m| m.id());
    modules
}

/// Run every applicable module in registry order.
pub fn run_all(evidence: &Evidence) -> Vec<Finding> {
    registry()
        .iter()
        .filter(|m| m.applies(evidence))
        .filter_map(|m| m.run(evidence))
        .collect()
}

/* ============================= HELPERS ============================= */

fn finding(
    module_id: &str,
    severity: FindingSeverity,
    label: impl Into<String>,
    why: Vec<String>,
    next: Vec<String>,
    evidence_refs: Vec<String>,
) -> Option<Finding> {
    Some(Finding {
        module_id: module_id.to_string(),
        severity,
        label: label.into(),
        why,
        next,
        evidence_refs,
    })
}

fn pod_coords(evidence: &Evidence) -> Option<(String, String)> {
    evidence.pod().map(|p| (p.namespace.clone(), p.name.clone()))
}

fn kubectl_describe_pod(namespace: &str, pod: &str) -> String {
    format!("kubectl describe pod {pod} -n {namespace}")
}

fn kubectl_previous_logs(namespace: &str, pod: &str) -> String {
    format!("kubectl logs {pod} -n {namespace} --previous")
}

fn waiting_reason<'a>(evidence: &'a Evidence, wanted: &str) -> Option<(&'a str, String)> {
    evidence.pod().and_then(|p| {
        p.containers.iter().find_map(|c| match &c.state {
            ContainerState::Waiting { reason } if reason == wanted => {
                Some((c.name.as_str(), c.image.clone()))
            }
            _ => None,
        })
    })
}

fn aws_subsystem_unavailable<'a>(evidence: &'a Evidence, name: &str) -> Option<&'a str> {
    evidence
        .aws
        .as_ref()
        .and_then(|slot| slot.get())
        .and_then(|aws| aws.subsystems.get(name))
        .and_then(|s| s.status.reason())
}

/* ============================= K8S STATE MODULES ============================= */

struct CrashLoopBackOff;

impl Diagnostic for CrashLoopBackOff {
    fn id(&self) -> &'static str {
        "crash_loop_backoff"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        waiting_reason(evidence, "CrashLoopBackOff").is_some()
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let (ns, pod) = pod_coords(evidence)?;
        let container = evidence
            .pod()?
            .containers
            .iter()
            .find(|c| matches!(&c.state, ContainerState::Waiting { reason } if reason == "CrashLoopBackOff"))?;
        let mut why = vec![format!(
            "container {} is in CrashLoopBackOff with {} restarts",
            container.name, container.restart_count
        )];
        if let Some(term) = &container.last_terminated {
            why.push(format!(
                "last termination: {} (exit {})",
                term.reason, term.exit_code
            ));
        }
        finding(
            self.id(),
            FindingSeverity::Critical,
            "container restarting in a crash loop",
            why,
            vec![
                kubectl_previous_logs(&ns, &pod),
                kubectl_describe_pod(&ns, &pod),
            ],
            vec![format!("k8s.pod.containers[{}].state", container.name)],
        )
    }
}

struct OomKilled;

impl Diagnostic for OomKilled {
    fn id(&self) -> &'static str {
        "oom_killed"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.pod().is_some_and(|p| {
            p.containers.iter().any(|c| {
                matches!(&c.state, ContainerState::Terminated { reason, .. } if reason == "OOMKilled")
                    || c.last_terminated.as_ref().is_some_and(|t| t.reason == "OOMKilled")
            })
        })
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let (ns, pod) = pod_coords(evidence)?;
        let container = evidence.pod()?.containers.iter().find(|c| {
            matches!(&c.state, ContainerState::Terminated { reason, .. } if reason == "OOMKilled")
                || c.last_terminated.as_ref().is_some_and(|t| t.reason == "OOMKilled")
        })?;
        let exit_code = match &container.state {
            ContainerState::Terminated { exit_code, .. } => *exit_code,
            _ => container
                .last_terminated
                .as_ref()
                .map(|t| t.exit_code)
                .unwrap_or(137),
        };

        let mut why = vec![format!(
            "container {} was OOMKilled (exit {exit_code})",
            container.name
        )];
        if let Some(limit) = container.memory_limit_bytes {
            why.push(format!("memory limit is {} bytes", limit));
            if let Some(peak) = evidence.metric_latest("memory_working_set_bytes") {
                let pct = (peak / limit as f64) * 100.0;
                why.push(format!(
                    "peak working set {:.0} bytes ({:.1}% of limit)",
                    peak, pct
                ));
            }
        }
        if container.restart_count > 0 {
            why.push(format!("{} restarts recorded", container.restart_count));
        }

        finding(
            self.id(),
            FindingSeverity::Critical,
            format!("OOMKilled (exit {exit_code})"),
            why,
            vec![
                kubectl_previous_logs(&ns, &pod),
                format!(
                    "promql: max(container_memory_working_set_bytes{{namespace=\"{ns}\",pod=\"{pod}\"}})"
                ),
                kubectl_describe_pod(&ns, &pod),
            ],
            vec![
                format!("k8s.pod.containers[{}].last_terminated", container.name),
                "metrics.memory_working_set_bytes".to_string(),
            ],
        )
    }
}

struct ImagePullBackOff;

impl Diagnostic for ImagePullBackOff {
    fn id(&self) -> &'static str {
        "image_pull_backoff"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        waiting_reason(evidence, "ImagePullBackOff").is_some()
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let (ns, pod) = pod_coords(evidence)?;
        let (container, image) = waiting_reason(evidence, "ImagePullBackOff")?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "image cannot be pulled",
            vec![format!("container {container} is stuck pulling image {image}")],
            vec![
                kubectl_describe_pod(&ns, &pod),
                format!("kubectl get events -n {ns} --field-selector involvedObject.name={pod}"),
            ],
            vec![format!("k8s.pod.containers[{container}].state")],
        )
    }
}

struct ErrImagePull;

impl Diagnostic for ErrImagePull {
    fn id(&self) -> &'static str {
        "err_image_pull"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        waiting_reason(evidence, "ErrImagePull").is_some()
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let (ns, pod) = pod_coords(evidence)?;
        let (container, image) = waiting_reason(evidence, "ErrImagePull")?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "image pull failing",
            vec![format!("container {container} failed to pull image {image}")],
            vec![kubectl_describe_pod(&ns, &pod)],
            vec![format!("k8s.pod.containers[{container}].state")],
        )
    }
}

struct ContainerCreateConfigError;

impl Diagnostic for ContainerCreateConfigError {
    fn id(&self) -> &'static str {
        "container_create_config_error"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        waiting_reason(evidence, "CreateContainerConfigError").is_some()
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let (ns, pod) = pod_coords(evidence)?;
        let (container, _) = waiting_reason(evidence, "CreateContainerConfigError")?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "container config invalid",
            vec![format!(
                "container {container} cannot start: referenced ConfigMap or Secret is missing or malformed"
            )],
            vec![
                kubectl_describe_pod(&ns, &pod),
                format!("kubectl get configmaps,secrets -n {ns}"),
            ],
            vec![format!("k8s.pod.containers[{container}].state")],
        )
    }
}

struct InitContainerFailing;

impl Diagnostic for InitContainerFailing {
    fn id(&self) -> &'static str {
        "init_container_failing"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.pod().is_some_and(|p| {
            p.init_containers.iter().any(|c| {
                matches!(&c.state, ContainerState::Waiting { .. })
                    || matches!(&c.state, ContainerState::Terminated { exit_code, .. } if *exit_code != 0)
            })
        })
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let (ns, pod) = pod_coords(evidence)?;
        let init = evidence.pod()?.init_containers.iter().find(|c| {
            !matches!(&c.state, ContainerState::Running)
                && !matches!(&c.state, ContainerState::Terminated { exit_code, .. } if *exit_code == 0)
        })?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "init container not completing",
            vec![format!("init container {} has not completed successfully", init.name)],
            vec![format!("kubectl logs {pod} -n {ns} -c {}", init.name)],
            vec![format!("k8s.pod.init_containers[{}]", init.name)],
        )
    }
}

struct PodPendingUnschedulable;

impl Diagnostic for PodPendingUnschedulable {
    fn id(&self) -> &'static str {
        "pod_pending_unschedulable"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.pod().is_some_and(|p| p.phase == "Pending")
            && evidence.has_event_reason("FailedScheduling")
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let (ns, pod) = pod_coords(evidence)?;
        let message = evidence
            .events()
            .iter()
            .find(|e| e.reason == "FailedScheduling")
            .map(|e| e.message.clone())
            .unwrap_or_default();
        finding(
            self.id(),
            FindingSeverity::Error,
            "pod cannot be scheduled",
            vec![format!("scheduler reports: {message}")],
            vec![
                kubectl_describe_pod(&ns, &pod),
                "kubectl get nodes -o wide".to_string(),
                "kubectl top nodes".to_string(),
            ],
            vec!["k8s.events[FailedScheduling]".to_string()],
        )
    }
}

struct NodePressureEviction;

impl Diagnostic for NodePressureEviction {
    fn id(&self) -> &'static str {
        "node_pressure_eviction"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.has_event_reason("Evicted")
            || evidence.events().iter().any(|e| e.message.contains("node had condition"))
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let event = evidence
            .events()
            .iter()
            .find(|e| e.reason == "Evicted" || e.message.contains("node had condition"))?;
        let node = evidence.pod().and_then(|p| p.node.clone()).unwrap_or_else(|| "<node>".into());
        finding(
            self.id(),
            FindingSeverity::Error,
            "pod evicted under node pressure",
            vec![format!("eviction event: {}", event.message)],
            vec![
                format!("kubectl describe node {node}"),
                "kubectl top nodes".to_string(),
            ],
            vec!["k8s.events[Evicted]".to_string()],
        )
    }
}

struct VolumeMountFailure;

impl Diagnostic for VolumeMountFailure {
    fn id(&self) -> &'static str {
        "volume_mount_failure"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.has_event_reason("FailedMount") || evidence.has_event_reason("FailedAttachVolume")
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let event = evidence
            .events()
            .iter()
            .find(|e| e.reason == "FailedMount" || e.reason == "FailedAttachVolume")?;
        let next = match pod_coords(evidence) {
            Some((ns, pod)) => vec![
                kubectl_describe_pod(&ns, &pod),
                format!("kubectl get pvc -n {ns}"),
            ],
            None => vec!["kubectl get pvc -A".to_string()],
        };
        finding(
            self.id(),
            FindingSeverity::Error,
            "volume mount failing",
            vec![format!("{}: {}", event.reason, event.message)],
            next,
            vec![format!("k8s.events[{}]", event.reason)],
        )
    }
}

struct ReadinessProbeFailing;

impl Diagnostic for ReadinessProbeFailing {
    fn id(&self) -> &'static str {
        "readiness_probe_failing"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .events()
            .iter()
            .any(|e| e.reason == "Unhealthy" && e.message.contains("Readiness"))
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let event = evidence
            .events()
            .iter()
            .find(|e| e.reason == "Unhealthy" && e.message.contains("Readiness"))?;
        let next = match pod_coords(evidence) {
            Some((ns, pod)) => vec![kubectl_describe_pod(&ns, &pod)],
            None => vec![],
        };
        finding(
            self.id(),
            FindingSeverity::Warn,
            "readiness probe failing",
            vec![format!("probe output: {} (x{})", event.message, event.count)],
            next,
            vec!["k8s.events[Unhealthy]".to_string()],
        )
    }
}

struct LivenessProbeFailing;

impl Diagnostic for LivenessProbeFailing {
    fn id(&self) -> &'static str {
        "liveness_probe_failing"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .events()
            .iter()
            .any(|e| e.reason == "Unhealthy" && e.message.contains("Liveness"))
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let event = evidence
            .events()
            .iter()
            .find(|e| e.reason == "Unhealthy" && e.message.contains("Liveness"))?;
        let next = match pod_coords(evidence) {
            Some((ns, pod)) => vec![kubectl_previous_logs(&ns, &pod)],
            None => vec![],
        };
        finding(
            self.id(),
            FindingSeverity::Error,
            "liveness probe failing, container will be restarted",
            vec![format!("probe output: {} (x{})", event.message, event.count)],
            next,
            vec!["k8s.events[Unhealthy]".to_string()],
        )
    }
}

struct ServiceAccountForbidden;

impl Diagnostic for ServiceAccountForbidden {
    fn id(&self) -> &'static str {
        "service_account_forbidden"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.events().iter().any(|e| e.message.contains("forbidden"))
            || evidence
                .parsed_patterns()
                .iter()
                .any(|p| p.representative_line.contains("forbidden"))
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let detail = evidence
            .events()
            .iter()
            .find(|e| e.message.contains("forbidden"))
            .map(|e| e.message.clone())
            .or_else(|| {
                evidence
                    .parsed_patterns()
                    .iter()
                    .find(|p| p.representative_line.contains("forbidden"))
                    .map(|p| p.representative_line.clone())
            })?;
        let ns = evidence.pod().map(|p| p.namespace.clone()).unwrap_or_else(|| "<ns>".into());
        finding(
            self.id(),
            FindingSeverity::Error,
            "RBAC denial observed",
            vec![format!("forbidden response: {detail}")],
            vec![
                format!("kubectl auth can-i --list --as=system:serviceaccount:{ns}:default"),
                format!("kubectl get rolebindings,clusterrolebindings -n {ns}"),
            ],
            vec!["k8s.events".to_string(), "logs.parsed_patterns".to_string()],
        )
    }
}

/* ============================= WORKLOAD MODULES ============================= */

struct ReplicaUnavailable;

impl Diagnostic for ReplicaUnavailable {
    fn id(&self) -> &'static str {
        "replica_unavailable"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .workload()
            .is_some_and(|w| w.replicas_desired > 0 && w.replicas_available < w.replicas_desired)
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let w = evidence.workload()?;
        let severity = if w.replicas_available == 0 {
            FindingSeverity::Critical
        } else {
            FindingSeverity::Warn
        };
        finding(
            self.id(),
            severity,
            "workload below desired replica count",
            vec![format!(
                "{} has {}/{} replicas available",
                w.workload.key(),
                w.replicas_available,
                w.replicas_desired
            )],
            vec![format!(
                "kubectl rollout status {}/{} -n {}",
                w.workload.kind.to_lowercase(),
                w.workload.name,
                w.workload.namespace
            )],
            vec!["k8s.workload.replicas".to_string()],
        )
    }
}

struct RolloutStuck;

impl Diagnostic for RolloutStuck {
    fn id(&self) -> &'static str {
        "rollout_stuck"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .events()
            .iter()
            .any(|e| e.reason == "ProgressDeadlineExceeded")
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let w = evidence.workload();
        let target = w
            .map(|w| w.workload.key())
            .unwrap_or_else(|| "<workload>".into());
        let next = match w {
            Some(w) => vec![
                format!(
                    "kubectl rollout status {}/{} -n {}",
                    w.workload.kind.to_lowercase(),
                    w.workload.name,
                    w.workload.namespace
                ),
                format!(
                    "kubectl rollout undo {}/{} -n {}",
                    w.workload.kind.to_lowercase(),
                    w.workload.name,
                    w.workload.namespace
                ),
            ],
            None => vec![],
        };
        finding(
            self.id(),
            FindingSeverity::Error,
            "rollout exceeded its progress deadline",
            vec![format!("{target} stopped making rollout progress")],
            next,
            vec!["k8s.events[ProgressDeadlineExceeded]".to_string()],
        )
    }
}

struct JobBackoffLimitExceeded;

impl Diagnostic for JobBackoffLimitExceeded {
    fn id(&self) -> &'static str {
        "job_backoff_limit"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .job()
            .is_some_and(|j| j.failed > 0 && j.failed >= j.backoff_limit)
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let j = evidence.job()?;
        finding(
            self.id(),
            FindingSeverity::Critical,
            "job exhausted its backoff limit",
            vec![format!(
                "job {} failed {} times (backoffLimit {})",
                j.name, j.failed, j.backoff_limit
            )],
            vec![
                format!("kubectl describe job {} -n {}", j.name, j.namespace),
                format!("kubectl logs -n {} -l job-name={} --tail=100", j.namespace, j.name),
            ],
            vec!["k8s.job".to_string()],
        )
    }
}

struct JobDeadlineExceeded;

impl Diagnostic for JobDeadlineExceeded {
    fn id(&self) -> &'static str {
        "job_deadline_exceeded"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .job()
            .is_some_and(|j| j.failure_reason.as_deref() == Some("DeadlineExceeded"))
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let j = evidence.job()?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "job exceeded its active deadline",
            vec![format!(
                "job {} ran past activeDeadlineSeconds ({:?})",
                j.name, j.completion_deadline_seconds
            )],
            vec![format!("kubectl describe job {} -n {}", j.name, j.namespace)],
            vec!["k8s.job".to_string()],
        )
    }
}

/* ============================= METRICS MODULES ============================= */

const THROTTLE_SATURATION_THRESHOLD: f64 = 0.25;
const MEMORY_NEAR_LIMIT_RATIO: f64 = 0.90;
const HTTP_5XX_RATIO_THRESHOLD: f64 = 0.05;

struct CpuThrottleSaturation;

impl Diagnostic for CpuThrottleSaturation {
    fn id(&self) -> &'static str {
        "cpu_throttle_saturation"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .metric_latest("cpu_throttle_ratio")
            .is_some_and(|v| v >= THROTTLE_SATURATION_THRESHOLD)
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let ratio = evidence.metric_latest("cpu_throttle_ratio")?;
        let usage = evidence.metric_latest("cpu_usage_cores");
        let mut why = vec![format!("{:.1}% of CPU periods are throttled", ratio * 100.0)];
        if let Some(u) = usage {
            why.push(format!("current usage {:.3} cores", u));
        }
        finding(
            self.id(),
            FindingSeverity::Warn,
            "CPU throttling is saturating the workload",
            why,
            vec![
                "promql: sum(rate(container_cpu_cfs_throttled_periods_total[5m])) / sum(rate(container_cpu_cfs_periods_total[5m]))".to_string(),
            ],
            vec!["metrics.cpu_throttle_ratio".to_string()],
        )
    }
}

struct MemoryNearLimit;

impl Diagnostic for MemoryNearLimit {
    fn id(&self) -> &'static str {
        "memory_near_limit"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        match (
            evidence.metric_latest("memory_working_set_bytes"),
            evidence.metric_latest("memory_limit_bytes"),
        ) {
            (Some(used), Some(limit)) if limit > 0.0 => used / limit >= MEMORY_NEAR_LIMIT_RATIO,
            _ => false,
        }
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let used = evidence.metric_latest("memory_working_set_bytes")?;
        let limit = evidence.metric_latest("memory_limit_bytes")?;
        finding(
            self.id(),
            FindingSeverity::Warn,
            "memory working set near limit",
            vec![format!(
                "working set is {:.1}% of the memory limit",
                used / limit * 100.0
            )],
            vec![
                "promql: max(container_memory_working_set_bytes) / max(kube_pod_container_resource_limits{resource=\"memory\"})".to_string(),
            ],
            vec![
                "metrics.memory_working_set_bytes".to_string(),
                "metrics.memory_limit_bytes".to_string(),
            ],
        )
    }
}

struct Http5xxSpike;

impl Diagnostic for Http5xxSpike {
    fn id(&self) -> &'static str {
        "http_5xx_spike"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        match (
            evidence.metric_latest("http_5xx_rate"),
            evidence.metric_latest("http_total_rate"),
        ) {
            (Some(err), Some(total)) if total > 0.0 => err / total >= HTTP_5XX_RATIO_THRESHOLD,
            (Some(err), None) => err > 0.0,
            _ => false,
        }
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let err = evidence.metric_latest("http_5xx_rate")?;
        let why = match evidence.metric_latest("http_total_rate") {
            Some(total) if total > 0.0 => vec![format!(
                "5xx responses are {:.1}% of traffic ({:.2}/s of {:.2}/s)",
                err / total * 100.0,
                err,
                total
            )],
            _ => vec![format!("5xx responses at {:.2}/s", err)],
        };
        finding(
            self.id(),
            FindingSeverity::Error,
            "elevated 5xx response rate",
            why,
            vec![
                "promql: sum by (code) (rate(http_requests_total{code=~\"5..\"}[5m]))".to_string(),
            ],
            vec!["metrics.http_5xx_rate".to_string()],
        )
    }
}

struct TargetScrapeDown;

impl Diagnostic for TargetScrapeDown {
    fn id(&self) -> &'static str {
        "target_scrape_down"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.metric_latest("scrape_up").is_some_and(|v| v == 0.0)
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let _ = evidence.metric_latest("scrape_up")?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "scrape target is down",
            vec!["the target's `up` series is 0: Prometheus cannot reach its metrics endpoint".to_string()],
            vec![
                "curl -sS http://<target>/metrics | head".to_string(),
                "kubectl get endpoints -A | grep <job>".to_string(),
                "promql: up == 0".to_string(),
            ],
            vec!["metrics.scrape_up".to_string()],
        )
    }
}

/* ============================= LOG MODULES ============================= */

const ERROR_SURGE_THRESHOLD: u64 = 10;
const TIMEOUT_PATTERN_THRESHOLD: u64 = 3;

struct ErrorLogSurge;

impl Diagnostic for ErrorLogSurge {
    fn id(&self) -> &'static str {
        "error_log_surge"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        count_kind(evidence.parsed_patterns(), PatternKind::ErrorPrefix) >= ERROR_SURGE_THRESHOLD
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let count = count_kind(evidence.parsed_patterns(), PatternKind::ErrorPrefix);
        let representative = evidence
            .parsed_patterns()
            .iter()
            .find(|p| p.pattern_kind == PatternKind::ErrorPrefix)?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "error log volume is elevated",
            vec![
                format!("{count} ERROR lines in the window"),
                format!("most common: {}", representative.representative_line),
            ],
            vec![],
            vec!["logs.parsed_patterns[error_prefix]".to_string()],
        )
    }
}

struct FatalLogPattern;

impl Diagnostic for FatalLogPattern {
    fn id(&self) -> &'static str {
        "fatal_log_pattern"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        count_kind(evidence.parsed_patterns(), PatternKind::FatalPrefix) > 0
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let p = evidence
            .parsed_patterns()
            .iter()
            .find(|p| p.pattern_kind == PatternKind::FatalPrefix)?;
        finding(
            self.id(),
            FindingSeverity::Critical,
            "fatal log entry observed",
            vec![format!("{} (x{})", p.representative_line, p.count)],
            vec![],
            vec!["logs.parsed_patterns[fatal_prefix]".to_string()],
        )
    }
}

struct StackTracePresent;

impl Diagnostic for StackTracePresent {
    fn id(&self) -> &'static str {
        "stack_trace_present"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        count_kind(evidence.parsed_patterns(), PatternKind::Exception) > 0
            || count_kind(evidence.parsed_patterns(), PatternKind::StackFrame) > 0
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let p = evidence.parsed_patterns().iter().find(|p| {
            matches!(p.pattern_kind, PatternKind::Exception | PatternKind::StackFrame)
        })?;
        finding(
            self.id(),
            FindingSeverity::Warn,
            "exception stack traces in logs",
            vec![format!("{} (x{})", p.representative_line, p.count)],
            vec![],
            vec!["logs.parsed_patterns[exception]".to_string()],
        )
    }
}

struct ConnectionRefusedPattern;

impl Diagnostic for ConnectionRefusedPattern {
    fn id(&self) -> &'static str {
        "connection_refused_pattern"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        count_kind(evidence.parsed_patterns(), PatternKind::Connection) > 0
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let p = evidence
            .parsed_patterns()
            .iter()
            .find(|p| p.pattern_kind == PatternKind::Connection)?;
        finding(
            self.id(),
            FindingSeverity::Error,
            "downstream connection failures",
            vec![format!("{} (x{})", p.representative_line, p.count)],
            vec![
                "kubectl get endpoints -A | grep -v none".to_string(),
            ],
            vec!["logs.parsed_patterns[connection]".to_string()],
        )
    }
}

struct TimeoutPattern;

impl Diagnostic for TimeoutPattern {
    fn id(&self) -> &'static str {
        "timeout_pattern"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        count_kind(evidence.parsed_patterns(), PatternKind::Timeout) >= TIMEOUT_PATTERN_THRESHOLD
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let p = evidence
            .parsed_patterns()
            .iter()
            .find(|p| p.pattern_kind == PatternKind::Timeout)?;
        finding(
            self.id(),
            FindingSeverity::Warn,
            "repeated timeouts in logs",
            vec![format!("{} (x{})", p.representative_line, p.count)],
            vec![],
            vec!["logs.parsed_patterns[timeout]".to_string()],
        )
    }
}

/* ============================= AWS MODULES ============================= */

struct NatGatewayUnreachable;

impl Diagnostic for NatGatewayUnreachable {
    fn id(&self) -> &'static str {
        "nat_gateway_unreachable"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .aws
            .as_ref()
            .and_then(|slot| slot.get())
            .and_then(|aws| aws.subsystems.get("nat_gateways"))
            .and_then(|s| s.get())
            .and_then(|v| v.get("gateways"))
            .and_then(|g| g.as_array())
            .is_some_and(|gateways| {
                gateways.iter().any(|g| {
                    g.get("state").and_then(|s| s.as_str()).is_some_and(|s| s != "available")
                })
            })
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let gateways = evidence
            .aws
            .as_ref()?
            .get()?
            .subsystems
            .get("nat_gateways")?
            .get()?
            .get("gateways")?
            .as_array()?;
        let bad = gateways.iter().find(|g| {
            g.get("state").and_then(|s| s.as_str()).is_some_and(|s| s != "available")
        })?;
        let id = bad.get("id").and_then(|v| v.as_str()).unwrap_or("<nat>");
        finding(
            self.id(),
            FindingSeverity::Critical,
            "NAT gateway is not available",
            vec![format!(
                "{id} is in state {}",
                bad.get("state").and_then(|v| v.as_str()).unwrap_or("unknown")
            )],
            vec![format!("aws ec2 describe-nat-gateways --nat-gateway-ids {id}")],
            vec!["aws.nat_gateways".to_string()],
        )
    }
}

struct ElbUnhealthyTargets;

impl Diagnostic for ElbUnhealthyTargets {
    fn id(&self) -> &'static str {
        "elb_unhealthy_targets"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .aws
            .as_ref()
            .and_then(|slot| slot.get())
            .and_then(|aws| aws.subsystems.get("elb_target_health"))
            .and_then(|s| s.get())
            .and_then(|v| v.get("groups"))
            .and_then(|g| g.as_array())
            .is_some_and(|groups| {
                groups
                    .iter()
                    .any(|g| g.get("unhealthy").and_then(|u| u.as_u64()).unwrap_or(0) > 0)
            })
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let groups = evidence
            .aws
            .as_ref()?
            .get()?
            .subsystems
            .get("elb_target_health")?
            .get()?
            .get("groups")?
            .as_array()?;
        let bad = groups
            .iter()
            .find(|g| g.get("unhealthy").and_then(|u| u.as_u64()).unwrap_or(0) > 0)?;
        let name = bad
            .get("target_group")
            .and_then(|v| v.as_str())
            .unwrap_or("<target-group>");
        finding(
            self.id(),
            FindingSeverity::Error,
            "load balancer has unhealthy targets",
            vec![format!(
                "target group {name}: {}/{} targets unhealthy",
                bad.get("unhealthy").and_then(|v| v.as_u64()).unwrap_or(0),
                bad.get("targets").and_then(|v| v.as_u64()).unwrap_or(0)
            )],
            vec![format!(
                "aws elbv2 describe-target-health --target-group-arn <arn-of-{name}>"
            )],
            vec!["aws.elb_target_health".to_string()],
        )
    }
}

struct EbsThrottling;

impl Diagnostic for EbsThrottling {
    fn id(&self) -> &'static str {
        "ebs_throttling"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        aws_subsystem_unavailable(evidence, "ebs_volumes") == Some("throttled")
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let _ = aws_subsystem_unavailable(evidence, "ebs_volumes")?;
        finding(
            self.id(),
            FindingSeverity::Warn,
            "EBS API throttling in effect",
            vec!["DescribeVolumes is being throttled; storage evidence is partial".to_string()],
            vec!["aws ec2 describe-volumes --max-items 10".to_string()],
            vec!["aws.ebs_volumes".to_string()],
        )
    }
}

struct SecurityGroupBlocked;

impl Diagnostic for SecurityGroupBlocked {
    fn id(&self) -> &'static str {
        "security_group_blocked"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        count_kind(evidence.parsed_patterns(), PatternKind::Connection) > 0
            && evidence
                .aws
                .as_ref()
                .and_then(|slot| slot.get())
                .and_then(|aws| aws.subsystems.get("security_groups"))
                .is_some_and(|s| s.is_ok())
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        finding(
            self.id(),
            FindingSeverity::Info,
            "connection failures with security groups in scope",
            vec![
                "connection refused/reset patterns coincide with AWS-managed networking".to_string(),
            ],
            vec!["aws ec2 describe-security-groups --query 'SecurityGroups[].{id:GroupId,name:GroupName}'".to_string()],
            vec!["aws.security_groups".to_string(), "logs.parsed_patterns[connection]".to_string()],
        )
    }
}

struct EcrImageMissing;

impl Diagnostic for EcrImageMissing {
    fn id(&self) -> &'static str {
        "ecr_image_missing"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        let pulling_from_ecr = evidence.pod().is_some_and(|p| {
            p.containers.iter().any(|c| {
                c.image.contains(".ecr.")
                    && matches!(&c.state, ContainerState::Waiting { reason } if reason == "ImagePullBackOff" || reason == "ErrImagePull")
            })
        });
        pulling_from_ecr
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let container = evidence.pod()?.containers.iter().find(|c| c.image.contains(".ecr."))?;
        let (repo, tag) = container
            .image
            .rsplit_once(':')
            .unwrap_or((container.image.as_str(), "latest"));
        let repo_name = repo.rsplit('/').next().unwrap_or(repo);
        finding(
            self.id(),
            FindingSeverity::Error,
            "ECR image cannot be pulled",
            vec![format!("image {} is failing to pull from ECR", container.image)],
            vec![format!(
                "aws ecr describe-images --repository-name {repo_name} --image-ids imageTag={tag}"
            )],
            vec![format!("k8s.pod.containers[{}].image", container.name)],
        )
    }
}

/* ============================= CHANGE MODULES ============================= */

struct CloudtrailRecentChange;

impl Diagnostic for CloudtrailRecentChange {
    fn id(&self) -> &'static str {
        "cloudtrail_recent_change"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence
            .aws
            .as_ref()
            .and_then(|slot| slot.get())
            .and_then(|aws| aws.cloudtrail.get())
            .is_some_and(|events| !events.is_empty())
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let events = evidence.aws.as_ref()?.get()?.cloudtrail.get()?;
        let latest = events.last()?;
        finding(
            self.id(),
            FindingSeverity::Info,
            "recent AWS control-plane activity",
            vec![format!(
                "{} CloudTrail events in the lookback window; latest: {}",
                events.len(),
                latest.event_name
            )],
            vec!["aws cloudtrail lookup-events --max-results 20".to_string()],
            vec!["aws.cloudtrail".to_string()],
        )
    }
}

struct RecentDeployCorrelation;

impl Diagnostic for RecentDeployCorrelation {
    fn id(&self) -> &'static str {
        "recent_deploy_correlation"
    }

    fn applies(&self, evidence: &Evidence) -> bool {
        evidence.change.is_ok()
    }

    fn run(&self, evidence: &Evidence) -> Option<Finding> {
        let change = evidence.change.get()?;
        let summary = change.summary.clone()?;
        finding(
            self.id(),
            FindingSeverity::Info,
            "recent change correlates with the alert window",
            vec![format!(
                "latest change ({}): {summary}",
                change.source.as_deref().unwrap_or("unknown")
            )],
            vec![],
            vec!["change".to_string()],
        )
    }
}

/* ============================= STATUS GUARD ============================= */

/// Findings are only as good as the slots behind them; expose whether any
/// slot that a module family depends on was unavailable (used by scoring
/// for diagnostic coverage).
pub fn coverage(evidence: &Evidence) -> (u32, u32) {
    let mut available = 0;
    let mut total = 0;
    for status in [
        &evidence.k8s.status,
        &evidence.metrics.status,
        &evidence.logs.status,
        &evidence.change.status,
    ] {
        total += 1;
        if !matches!(status, SlotStatus::Unavailable { .. }) {
            available += 1;
        }
    }
    if let Some(aws) = &evidence.aws {
        total += 1;
        if !matches!(aws.status, SlotStatus::Unavailable { .. }) {
            available += 1;
        }
    }
    if let Some(github) = &evidence.github {
        total += 1;
        if !matches!(github.status, SlotStatus::Unavailable { .. }) {
            available += 1;
        }
    }
    (available, total)
}

/* ============================= TESTS ============================= */
