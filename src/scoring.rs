//! Scoring and classification.
//!
//! Three integer axes in 0..=100: impact (how wide and how bad), confidence
//! (how complete the evidence is), noise (how likely this is recurrence or
//! alert-pipeline chatter). Classification folds the axes into one of four
//! buckets, with blocked scenarios downgrading to `artifact` regardless of
//! impact.

use crate::evidence::{Evidence, SlotStatus};
use crate::model::{
    AlertInstance, BlockedScenario, Classification, Family, Finding, FindingSeverity, Hypothesis,
    Identity, Scores,
};

/* ============================= THRESHOLDS ============================= */

pub const T_ACTIONABLE: u8 = 60;
pub const T_NOISE: u8 = 70;

/* ============================= WEIGHTS ============================= */

pub struct ImpactWeights {
    pub scope_unknown: u8,
    pub scope_nonpod: u8,
    pub scope_job: u8,
    pub scope_pod: u8,
    pub scope_workload: u8,
    pub severity_critical: u8,
    pub severity_warning: u8,
    pub finding_critical: u8,
    pub finding_error: u8,
    pub finding_warn: u8,
    pub restart_churn: u8,
    pub http_5xx_ratio: u8,
    pub replicas_degraded: u8,
    pub replicas_none: u8,
}

impl Default for ImpactWeights {
    fn default() -> Self {
        Self {
            scope_unknown: 5,
            scope_nonpod: 30,
            scope_job: 35,
            scope_pod: 40,
            scope_workload: 50,
            severity_critical: 15,
            severity_warning: 5,
            finding_critical: 25,
            finding_error: 15,
            finding_warn: 5,
            restart_churn: 10,
            http_5xx_ratio: 15,
            replicas_degraded: 10,
            replicas_none: 25,
        }
    }
}

/* ============================= INPUTS ============================= */

pub struct ScoreInputs<'a> {
    pub identity: &'a Identity,
    pub family: Family,
    pub alert: &'a AlertInstance,
    pub evidence: &'a Evidence,
    pub findings: &'a [Finding],
    pub hypotheses: &'a [Hypothesis],
    pub blocked: &'a [BlockedScenario],
    /// Prior runs for this case within the last 24h, from the index.
    /// Zero when the index is unavailable.
    pub recurrence_24h: u32,
}

/* ============================= IMPACT ============================= */

const RESTART_CHURN_THRESHOLD: i32 = 10;
const HTTP_5XX_RATIO: f64 = 0.05;

pub fn impact(inputs: &ScoreInputs) -> u8 {
    let w = ImpactWeights::default();
    let mut score: u32 = match inputs.identity {
        Identity::Unknown => w.scope_unknown,
        Identity::NonPod { .. } => w.scope_nonpod,
        Identity::Job { .. } => w.scope_job,
        Identity::Pod { .. } => w.scope_pod,
        Identity::Workload { .. } => w.scope_workload,
    } as u32;

    match inputs.alert.severity() {
        Some("critical") => score += w.severity_critical as u32,
        Some("warning") => score += w.severity_warning as u32,
        _ => {}
    }

    if let Some(top) = inputs.findings.iter().map(|f| f.severity).max() {
        score += match top {
            FindingSeverity::Critical => w.finding_critical,
            FindingSeverity::Error => w.finding_error,
            FindingSeverity::Warn => w.finding_warn,
            FindingSeverity::Info => 0,
        } as u32;
    }

    let max_restarts = inputs
        .evidence
        .pod()
        .map(|p| p.containers.iter().map(|c| c.restart_count).max().unwrap_or(0))
        .unwrap_or(0);
    if max_restarts >= RESTART_CHURN_THRESHOLD {
        score += w.restart_churn as u32;
    }

    if let (Some(err), Some(total)) = (
        inputs.evidence.metric_latest("http_5xx_rate"),
        inputs.evidence.metric_latest("http_total_rate"),
    ) {
        if total > 0.0 && err / total >= HTTP_5XX_RATIO {
            score += w.http_5xx_ratio as u32;
        }
    }

    if let Some(workload) = inputs.evidence.workload() {
        if workload.replicas_desired > 0 {
            if workload.replicas_available == 0 {
                score += w.replicas_none as u32;
            } else if workload.replicas_available < workload.replicas_desired {
                score += w.replicas_degraded as u32;
            }
        }
    }

    let score = score.min(100) as u8;

    // Scenario A: without an identity the blast radius cannot honestly
    // exceed "unknown, probably small".
    if matches!(inputs.identity, Identity::Unknown) {
        score.min(25)
    } else {
        score
    }
}

/* ============================= CONFIDENCE ============================= */

pub fn confidence(inputs: &ScoreInputs) -> u8 {
    let ev = inputs.evidence;
    let mut score: u32 = 0;

    if ev.k8s.is_ok() {
        score += 25;
    }
    if ev.metrics.is_ok() {
        score += 20;
    }
    match ev.logs.status {
        SlotStatus::Ok => score += 15,
        // An empty answer is still an answer.
        SlotStatus::Empty => score += 10,
        SlotStatus::Unavailable { .. } => {}
    }
    if ev.change.is_ok() {
        score += 5;
    }
    if ev.aws.as_ref().is_some_and(|s| s.is_ok()) {
        score += 5;
    }

    if !inputs.findings.is_empty() {
        score += 15;
    }
    if inputs.findings.iter().any(|f| f.severity >= FindingSeverity::Error) {
        score += 5;
    }

    // Diagnostic coverage: how much of the slot surface the modules could
    // actually look at.
    let (available, total) = crate::diagnostics::coverage(ev);
    if total > 0 {
        score += available * 10 / total;
    }

    let consensus = inputs
        .hypotheses
        .iter()
        .map(|h| h.confidence_0_1)
        .fold(0.0f64, f64::max);
    score += (consensus * 15.0) as u32;

    let score = score.min(100) as u8;

    if inputs.blocked.contains(&BlockedScenario::TargetIdentityMissing) {
        score.min(25)
    } else {
        score
    }
}

/* ============================= NOISE ============================= */

pub fn noise(inputs: &ScoreInputs) -> u8 {
    let mut score: u32 = 0;

    score += match inputs.recurrence_24h {
        0 => 0,
        1..=2 => 10,
        3..=5 => 25,
        _ => 40,
    };

    if inputs.family == Family::Meta {
        score += 50;
    }

    // Lack of any impact proxy is itself a noise signal.
    let has_proxy = inputs.evidence.metrics.is_ok() || !inputs.findings.is_empty();
    if !has_proxy {
        score += 15;
    }

    match inputs.alert.severity() {
        Some("info") | Some("none") => score += 10,
        _ => {}
    }

    score.min(100) as u8
}

/* ============================= CLASSIFICATION ============================= */

/// True when something recoverable was observed: any finding, or any slot
/// that answered with data.
pub fn has_signal(evidence: &Evidence, findings: &[Finding]) -> bool {
    if !findings.is_empty() {
        return true;
    }
    evidence.k8s.is_ok()
        || evidence.metrics.is_ok()
        || evidence.logs.is_ok()
        || evidence.change.is_ok()
        || evidence.aws.as_ref().is_some_and(|s| s.is_ok())
        || evidence.github.as_ref().is_some_and(|s| s.is_ok())
}

pub fn classify(
    impact: u8,
    noise: u8,
    blocked: &[BlockedScenario],
    signal: bool,
) -> Classification {
    // Blocked states downgrade regardless of impact.
    if !blocked.is_empty() && !signal {
        return Classification::Artifact;
    }
    if noise >= T_NOISE {
        return Classification::Noisy;
    }
    if impact >= T_ACTIONABLE {
        return Classification::Actionable;
    }
    Classification::Informational
}

/// Compute all three axes and fold them into a classification.
pub fn score(inputs: &ScoreInputs) -> Scores {
    let impact = impact(inputs);
    let confidence = confidence(inputs);
    let noise = noise(inputs);
    let classification = classify(
        impact,
        noise,
        inputs.blocked,
        has_signal(inputs.evidence, inputs.findings),
    );
    Scores { impact, confidence, noise, classification }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{
        ContainerSnapshot, ContainerState, K8sEvidence, PodSnapshot, Slot, TerminationRecord,
    };
    use crate::model::AlertStatus;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn alert(severity: Option<&str>) -> AlertInstance {
        let mut labels = BTreeMap::new();
        if let Some(s) = severity {
            labels.insert("severity".to_string(), s.to_string());
        }
        AlertInstance {
            fingerprint: "f".into(),
            alertname: "KubernetesPodNotHealthy".into(),
            labels,
            annotations: BTreeMap::new(),
            starts_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
            ends_at: None,
            status: AlertStatus::Firing,
        }
    }

    fn oom_evidence() -> Evidence {
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
        ev
    }

    fn pod_identity() -> Identity {
        Identity::Pod { cluster: "main".into(), namespace: "prod".into(), pod: "web-abc".into() }
    }

    #[test]
    fn test_oom_scenario_scores_high_impact() {
        let ev = oom_evidence();
        let findings = crate::diagnostics::run_all(&ev);
        let a = alert(None);
        let id = pod_identity();
        let inputs = ScoreInputs {
            identity: &id,
            family: Family::PodNotHealthy,
            alert: &a,
            evidence: &ev,
            findings: &findings,
            hypotheses: &[],
            blocked: &[],
            recurrence_24h: 0,
        };
        let scores = score(&inputs);
        assert!(scores.impact >= 70, "impact {} should be >= 70", scores.impact);
        assert_eq!(scores.classification, Classification::Actionable);
    }

    #[test]
    fn test_unknown_identity_caps_impact_and_confidence() {
        let ev = Evidence::pending(false, false);
        let a = alert(Some("critical"));
        let id = Identity::Unknown;
        let blocked = [BlockedScenario::TargetIdentityMissing];
        let inputs = ScoreInputs {
            identity: &id,
            family: Family::Generic,
            alert: &a,
            evidence: &ev,
            findings: &[],
            hypotheses: &[],
            blocked: &blocked,
            recurrence_24h: 0,
        };
        let scores = score(&inputs);
        assert!(scores.impact <= 25);
        assert!(scores.confidence <= 25);
        assert_eq!(scores.classification, Classification::Artifact);
    }

    #[test]
    fn test_recurrence_drives_noise() {
        let ev = oom_evidence();
        let a = alert(None);
        let id = pod_identity();
        let mk = |recurrence| {
            let inputs = ScoreInputs {
                identity: &id,
                family: Family::PodNotHealthy,
                alert: &a,
                evidence: &ev,
                findings: &[],
                hypotheses: &[],
                blocked: &[],
                recurrence_24h: recurrence,
            };
            noise(&inputs)
        };
        assert!(mk(0) < mk(1));
        assert!(mk(1) < mk(4));
        assert!(mk(4) < mk(10));
    }

    #[test]
    fn test_meta_family_classifies_noisy() {
        let ev = Evidence::pending(false, false);
        let a = alert(Some("none"));
        let id = Identity::NonPod { labels: BTreeMap::new() };
        let inputs = ScoreInputs {
            identity: &id,
            family: Family::Meta,
            alert: &a,
            evidence: &ev,
            findings: &[],
            hypotheses: &[],
            blocked: &[],
            recurrence_24h: 4,
        };
        let scores = score(&inputs);
        assert!(scores.noise >= T_NOISE, "noise {}", scores.noise);
        assert_eq!(scores.classification, Classification::Noisy);
    }

    #[test]
    fn test_blocked_without_signal_is_artifact_despite_impact() {
        let ev = Evidence::pending(false, false);
        let a = alert(Some("critical"));
        let id = Identity::Workload {
            cluster: "main".into(),
            namespace: "prod".into(),
            kind: "Deployment".into(),
            owner: "web".into(),
        };
        let blocked = [BlockedScenario::K8sUnavailable, BlockedScenario::MetricsUnavailable];
        let inputs = ScoreInputs {
            identity: &id,
            family: Family::K8sRollout,
            alert: &a,
            evidence: &ev,
            findings: &[],
            hypotheses: &[],
            blocked: &blocked,
            recurrence_24h: 0,
        };
        let scores = score(&inputs);
        assert_eq!(scores.classification, Classification::Artifact);
    }

    #[test]
    fn test_scores_always_in_range() {
        let ev = oom_evidence();
        let findings = crate::diagnostics::run_all(&ev);
        let a = alert(Some("critical"));
        let id = pod_identity();
        let inputs = ScoreInputs {
            identity: &id,
            family: Family::OomKilled,
            alert: &a,
            evidence: &ev,
            findings: &findings,
            hypotheses: &[],
            blocked: &[],
            recurrence_24h: 100,
        };
        let scores = score(&inputs);
        assert!(scores.impact <= 100);
        assert!(scores.confidence <= 100);
        assert!(scores.noise <= 100);
    }
}
