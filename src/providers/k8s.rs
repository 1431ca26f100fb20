use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Event, Pod};
use kube::api::{Api, ListParams};
use kube::Client;

use super::{REASON_FORBIDDEN, REASON_TIMEOUT, Slot, reason_http};
use crate::evidence::{
    ContainerSnapshot, ContainerState, EventSnapshot, JobSnapshot, PodCondition, PodSnapshot,
    TerminationRecord, WorkloadRef, WorkloadSnapshot,
};

/* ============================= CLIENT ============================= */

pub struct K8sProvider {
    client: Client,
}

impl K8sProvider {
    pub async fn connect() -> Result<K8sProvider> {
        let client = Client::try_default()
            .await
            .context("Failed to connect to Kubernetes cluster")?;
        Ok(K8sProvider { client })
    }

    pub fn from_client(client: Client) -> K8sProvider {
        K8sProvider { client }
    }

    pub async fn apiserver_version(&self) -> Result<String> {
        let v = self.client.apiserver_version().await?;
        Ok(format!("v{}.{}", v.major, v.minor))
    }

    /// Fetch one pod. `Empty` means the API answered but the pod does not
    /// exist (deleted or garbage-collected).
    pub async fn pod(&self, namespace: &str, name: &str) -> Slot<PodSnapshot> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(pod) => Slot::ok(snapshot_pod(&pod)),
            Err(e) => classify_kube_not_found_as_empty(e),
        }
    }

    /// Fetch the workload backing a [`WorkloadRef`].
    pub async fn workload(&self, workload: &WorkloadRef) -> Slot<WorkloadSnapshot> {
        match workload.kind.as_str() {
            "Deployment" => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &workload.namespace);
                match api.get(&workload.name).await {
                    Ok(d) => Slot::ok(snapshot_deployment(workload, &d)),
                    Err(e) => classify_kube_not_found_as_empty(e),
                }
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &workload.namespace);
                match api.get(&workload.name).await {
                    Ok(s) => Slot::ok(snapshot_statefulset(workload, &s)),
                    Err(e) => classify_kube_not_found_as_empty(e),
                }
            }
            "DaemonSet" => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &workload.namespace);
                match api.get(&workload.name).await {
                    Ok(d) => Slot::ok(snapshot_daemonset(workload, &d)),
                    Err(e) => classify_kube_not_found_as_empty(e),
                }
            }
            other => Slot::unavailable(format!("http_error:unsupported_kind_{other}")),
        }
    }

    pub async fn job(&self, namespace: &str, name: &str) -> Slot<JobSnapshot> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(j) => Slot::ok(snapshot_job(&j)),
            Err(e) => classify_kube_not_found_as_empty(e),
        }
    }

    /// Events mentioning the given object name, most recent last.
    pub async fn events(&self, namespace: &str, object_name: &str) -> Slot<Vec<EventSnapshot>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params =
            ListParams::default().fields(&format!("involvedObject.name={object_name}"));
        match api.list(&params).await {
            Ok(list) => {
                let mut events: Vec<EventSnapshot> =
                    list.items.iter().map(snapshot_event).collect();
                events.sort_by_key(|e| e.last_seen);
                if events.is_empty() {
                    Slot::empty()
                } else {
                    Slot::ok(events)
                }
            }
            Err(e) => Slot::unavailable(classify_kube_error(&e)),
        }
    }

    /// Pods created by a Job, via the `job-name` label kube sets on them.
    pub async fn pods_for_job(&self, namespace: &str, job_name: &str) -> Slot<Vec<PodSnapshot>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        match api.list(&params).await {
            Ok(list) => {
                let pods: Vec<PodSnapshot> = list.items.iter().map(snapshot_pod).collect();
                if pods.is_empty() {
                    Slot::empty()
                } else {
                    Slot::ok(pods)
                }
            }
            Err(e) => Slot::unavailable(classify_kube_error(&e)),
        }
    }

    /// Resolve a pod's owning workload through the API: ReplicaSet owners
    /// are followed one more hop to their Deployment.
    pub async fn resolve_owner_via_api(&self, pod: &PodSnapshot) -> Option<WorkloadRef> {
        let offline = resolve_owner(pod);
        match &offline {
            Some(w) if w.kind == "Deployment" => {
                // The offline heuristic strips the ReplicaSet hash; confirm
                // against the API when possible, else keep the heuristic.
                let api: Api<k8s_openapi::api::apps::v1::ReplicaSet> =
                    Api::namespaced(self.client.clone(), &pod.namespace);
                let rs_name = pod
                    .name
                    .rsplit_once('-')
                    .map(|(prefix, _)| prefix.to_string())
                    .unwrap_or_else(|| pod.name.clone());
                if let Ok(rs) = api.get(&rs_name).await {
                    if let Some(owners) = &rs.metadata.owner_references {
                        if let Some(owner) = owners.iter().find(|o| o.kind == "Deployment") {
                            return Some(WorkloadRef {
                                kind: "Deployment".to_string(),
                                name: owner.name.clone(),
                                namespace: pod.namespace.clone(),
                            });
                        }
                    }
                }
                offline
            }
            _ => offline,
        }
    }
}

/* ============================= ERROR CLASSIFICATION ============================= */

pub fn classify_kube_error(err: &kube::Error) -> String {
    match err {
        kube::Error::Api(resp) => match resp.code {
            401 | 403 => REASON_FORBIDDEN.to_string(),
            404 => "not_found".to_string(),
            code => reason_http(code),
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) => "connect_error".to_string(),
        _ => REASON_TIMEOUT.to_string(),
    }
}

/// 404 means the API answered and the object is gone: that is `Empty`,
/// not `Unavailable`.
fn classify_kube_not_found_as_empty<T>(err: kube::Error) -> Slot<T> {
    if let kube::Error::Api(resp) = &err {
        if resp.code == 404 {
            return Slot::empty();
        }
    }
    Slot::unavailable(classify_kube_error(&err))
}

/* ============================= OWNER RESOLUTION ============================= */

/// Resolve the parent workload from a pod snapshot's owner reference.
///
/// ReplicaSet owners are mapped to their Deployment by stripping the
/// pod-template-hash suffix (offline heuristic; see
/// `resolve_owner_via_api` for the API-backed hop).
pub fn resolve_owner(pod: &PodSnapshot) -> Option<WorkloadRef> {
    let owner = pod.owner.as_ref()?;
    match owner.kind.as_str() {
        "Deployment" | "StatefulSet" | "DaemonSet" | "Job" => Some(owner.clone()),
        "ReplicaSet" => Some(WorkloadRef {
            kind: "Deployment".to_string(),
            name: strip_replicaset_hash(&owner.name),
            namespace: owner.namespace.clone(),
        }),
        _ => None,
    }
}

/// Strip the ReplicaSet pod-template-hash suffix to derive the Deployment
/// name: `"web-app-5d4f8b9c7f"` becomes `"web-app"`.
pub fn strip_replicaset_hash(rs_name: &str) -> String {
    match rs_name.rfind('-') {
        Some(pos) if pos > 0 => rs_name[..pos].to_string(),
        _ => rs_name.to_string(),
    }
}

/* ============================= SNAPSHOTS ============================= */

pub fn snapshot_pod(pod: &Pod) -> PodSnapshot {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();

    let owner = pod.metadata.owner_references.as_ref().and_then(|owners| {
        owners.first().map(|o| WorkloadRef {
            kind: o.kind.clone(),
            name: o.name.clone(),
            namespace: namespace.clone(),
        })
    });

    let status = pod.status.as_ref();
    let spec = pod.spec.as_ref();

    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .map(|c| PodCondition {
                    condition_type: c.type_.clone(),
                    status: c.status.clone(),
                    reason: c.reason.clone(),
                    message: c.message.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let containers = zip_container_snapshots(
        spec.map(|s| s.containers.as_slice()).unwrap_or(&[]),
        status
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or(&[]),
    );
    let init_containers = zip_container_snapshots(
        spec.and_then(|s| s.init_containers.as_deref()).unwrap_or(&[]),
        status
            .and_then(|s| s.init_container_statuses.as_deref())
            .unwrap_or(&[]),
    );

    PodSnapshot {
        name,
        namespace,
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        node: spec.and_then(|s| s.node_name.clone()),
        conditions,
        containers,
        init_containers,
        owner,
        created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        deleted: pod.metadata.deletion_timestamp.is_some(),
    }
}

fn zip_container_snapshots(
    specs: &[Container],
    statuses: &[ContainerStatus],
) -> Vec<ContainerSnapshot> {
    specs
        .iter()
        .map(|c| {
            let status = statuses.iter().find(|s| s.name == c.name);
            let state = status
                .and_then(|s| s.state.as_ref())
                .map(|s| {
                    if s.running.is_some() {
                        ContainerState::Running
                    } else if let Some(w) = &s.waiting {
                        ContainerState::Waiting {
                            reason: w.reason.clone().unwrap_or_else(|| "Waiting".to_string()),
                        }
                    } else if let Some(t) = &s.terminated {
                        ContainerState::Terminated {
                            reason: t.reason.clone().unwrap_or_else(|| "Terminated".to_string()),
                            exit_code: t.exit_code,
                        }
                    } else {
                        ContainerState::Unknown
                    }
                })
                .unwrap_or(ContainerState::Unknown);

            let last_terminated = status
                .and_then(|s| s.last_state.as_ref())
                .and_then(|s| s.terminated.as_ref())
                .map(|t| TerminationRecord {
                    reason: t.reason.clone().unwrap_or_else(|| "Terminated".to_string()),
                    exit_code: t.exit_code,
                    finished_at: t.finished_at.as_ref().map(|ts| ts.0),
                });

            let limits = c.resources.as_ref().and_then(|r| r.limits.as_ref());
            let memory_limit_bytes = limits
                .and_then(|l| l.get("memory"))
                .and_then(|q| parse_memory_quantity(&q.0));
            let cpu_limit_millis = limits
                .and_then(|l| l.get("cpu"))
                .and_then(|q| parse_cpu_quantity(&q.0));

            ContainerSnapshot {
                name: c.name.clone(),
                image: c.image.clone().unwrap_or_default(),
                ready: status.map(|s| s.ready).unwrap_or(false),
                restart_count: status.map(|s| s.restart_count).unwrap_or(0),
                state,
                last_terminated,
                memory_limit_bytes,
                cpu_limit_millis,
            }
        })
        .collect()
}

fn snapshot_deployment(workload: &WorkloadRef, d: &Deployment) -> WorkloadSnapshot {
    let status = d.status.as_ref();
    WorkloadSnapshot {
        workload: workload.clone(),
        replicas_desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
        replicas_ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        replicas_available: status.and_then(|s| s.available_replicas).unwrap_or(0),
        image: d
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|t| t.containers.first())
            .and_then(|c| c.image.clone()),
        last_rollout_at: status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| {
                conds
                    .iter()
                    .find(|c| c.type_ == "Progressing")
                    .and_then(|c| c.last_update_time.as_ref())
                    .map(|t| t.0)
            }),
    }
}

fn snapshot_statefulset(workload: &WorkloadRef, s: &StatefulSet) -> WorkloadSnapshot {
    let status = s.status.as_ref();
    WorkloadSnapshot {
        workload: workload.clone(),
        replicas_desired: s.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(0),
        replicas_ready: status.and_then(|st| st.ready_replicas).unwrap_or(0),
        replicas_available: status.and_then(|st| st.available_replicas).unwrap_or(0),
        image: s
            .spec
            .as_ref()
            .and_then(|sp| sp.template.spec.as_ref())
            .and_then(|t| t.containers.first())
            .and_then(|c| c.image.clone()),
        last_rollout_at: None,
    }
}

fn snapshot_daemonset(workload: &WorkloadRef, d: &DaemonSet) -> WorkloadSnapshot {
    let status = d.status.as_ref();
    WorkloadSnapshot {
        workload: workload.clone(),
        replicas_desired: status.map(|st| st.desired_number_scheduled).unwrap_or(0),
        replicas_ready: status.map(|st| st.number_ready).unwrap_or(0),
        replicas_available: status.and_then(|st| st.number_available).unwrap_or(0),
        image: d
            .spec
            .as_ref()
            .and_then(|sp| sp.template.spec.as_ref())
            .and_then(|t| t.containers.first())
            .and_then(|c| c.image.clone()),
        last_rollout_at: None,
    }
}

pub fn snapshot_job(j: &Job) -> JobSnapshot {
    let status = j.status.as_ref();
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let failure_reason = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .and_then(|c| c.reason.clone())
        });

    JobSnapshot {
        name: j.metadata.name.clone().unwrap_or_default(),
        namespace: j.metadata.namespace.clone().unwrap_or_default(),
        attempts: failed + status.and_then(|s| s.succeeded).unwrap_or(0),
        backoff_limit: j.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(6),
        active: status.and_then(|s| s.active).unwrap_or(0),
        succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
        failed,
        completion_deadline_seconds: j.spec.as_ref().and_then(|s| s.active_deadline_seconds),
        failure_reason,
    }
}

fn snapshot_event(e: &Event) -> EventSnapshot {
    EventSnapshot {
        event_type: e.type_.clone().unwrap_or_else(|| "Normal".to_string()),
        reason: e.reason.clone().unwrap_or_default(),
        message: e.message.clone().unwrap_or_default(),
        count: e.count.unwrap_or(1),
        last_seen: e.last_timestamp.as_ref().map(|t| t.0),
        object: e.involved_object.name.clone().unwrap_or_default(),
    }
}

/* ============================= QUANTITIES ============================= */

/// Parse a Kubernetes memory quantity (`512Mi`, `2Gi`, `128974848`) into
/// bytes. Returns None for unparseable input rather than guessing.
pub fn parse_memory_quantity(q: &str) -> Option<u64> {
    let q = q.trim();
    if q.is_empty() {
        return None;
    }
    let split = match q.find(|c: char| !c.is_ascii_digit()) {
        Some(0) => return None,
        Some(pos) => pos,
        None => return q.parse().ok(),
    };
    let (num, suffix) = q.split_at(split);
    let base: u64 = num.parse().ok()?;
    let mult: u64 = match suffix {
        "Ki" => 1024,
        "Mi" => 1024 * 1024,
        "Gi" => 1024 * 1024 * 1024,
        "Ti" => 1024u64.pow(4),
        "k" | "K" => 1000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        _ => return None,
    };
    base.checked_mul(mult)
}

/// Parse a CPU quantity (`250m`, `2`) into millicores.
pub fn parse_cpu_quantity(q: &str) -> Option<u64> {
    let q = q.trim();
    if let Some(millis) = q.strip_suffix('m') {
        return millis.parse().ok();
    }
    q.parse::<u64>().ok().map(|cores| cores * 1000)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_snapshot_with_owner(kind: &str, name: &str) -> PodSnapshot {
        PodSnapshot {
            name: "web-app-5d4f8b9c7f-x2v9q".into(),
            namespace: "prod".into(),
            phase: "Running".into(),
            node: None,
            conditions: vec![],
            containers: vec![],
            init_containers: vec![],
            owner: Some(WorkloadRef {
                kind: kind.into(),
                name: name.into(),
                namespace: "prod".into(),
            }),
            created_at: None,
            deleted: false,
        }
    }

    #[test]
    fn test_strip_replicaset_hash() {
        assert_eq!(strip_replicaset_hash("web-app-5d4f8b9c7f"), "web-app");
        assert_eq!(strip_replicaset_hash("single"), "single");
        assert_eq!(strip_replicaset_hash("a-b-c"), "a-b");
    }

    #[test]
    fn test_resolve_owner_replicaset_maps_to_deployment() {
        let pod = pod_snapshot_with_owner("ReplicaSet", "web-app-5d4f8b9c7f");
        let owner = resolve_owner(&pod).unwrap();
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "web-app");
    }

    #[test]
    fn test_resolve_owner_direct_kinds() {
        for kind in ["Deployment", "StatefulSet", "DaemonSet", "Job"] {
            let pod = pod_snapshot_with_owner(kind, "thing");
            let owner = resolve_owner(&pod).unwrap();
            assert_eq!(owner.kind, kind);
            assert_eq!(owner.name, "thing");
        }
    }

    #[test]
    fn test_resolve_owner_none_for_bare_pod() {
        let mut pod = pod_snapshot_with_owner("Node", "n1");
        assert!(resolve_owner(&pod).is_none());
        pod.owner = None;
        assert!(resolve_owner(&pod).is_none());
    }

    #[test]
    fn test_parse_memory_quantity() {
        assert_eq!(parse_memory_quantity("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_quantity("2Gi"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_quantity("1000k"), Some(1_000_000));
        assert_eq!(parse_memory_quantity("128974848"), Some(128974848));
        assert_eq!(parse_memory_quantity("junk"), None);
        assert_eq!(parse_memory_quantity(""), None);
    }

    #[test]
    fn test_parse_cpu_quantity() {
        assert_eq!(parse_cpu_quantity("250m"), Some(250));
        assert_eq!(parse_cpu_quantity("2"), Some(2000));
        assert_eq!(parse_cpu_quantity("abc"), None);
    }

    #[test]
    fn test_workload_ref_key() {
        let w = WorkloadRef { kind: "Deployment".into(), name: "web".into(), namespace: "prod".into() };
        assert_eq!(w.key(), "deployment/prod/web");
    }
}
