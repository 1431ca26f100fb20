//! Investigation pipeline.
//!
//! Eleven stages in strict order; each stage runs under a bounded timeout
//! carved out of the total wall-clock budget. A stage that times out or
//! panics marks its outputs unavailable and the pipeline continues: the
//! report always renders, and unknowns stay explicit (the honesty
//! contract). Stage 11 (persist) runs at the persistence boundary in
//! `store::persist_with_retry`; everything up to the rendered report
//! happens here.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collectors::{
    self, Providers, collect_aws, collect_github, collect_k8s, collect_logs, collect_metrics,
};
use crate::config::Config;
use crate::diagnostics;
use crate::evidence::{Evidence, Slot, SlotStatus};
use crate::model::{
    Analysis, BlockedScenario, Decision, Finding, Identity, Investigation, InvestigationJob,
    case_id, is_rollout_noisy,
};
use crate::playbooks::{self, CollectorKind, PlaybookInput};
use crate::providers::k8s::resolve_owner;
use crate::report;
use crate::scoring::{self, ScoreInputs};

/* ============================= STAGES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    ResolveTarget,
    K8sContext,
    Metrics,
    Logs,
    ChangeCorrelation,
    Diagnostics,
    PlaybookInterpret,
    Score,
    Render,
    Persist,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Normalize,
        Stage::ResolveTarget,
        Stage::K8sContext,
        Stage::Metrics,
        Stage::Logs,
        Stage::ChangeCorrelation,
        Stage::Diagnostics,
        Stage::PlaybookInterpret,
        Stage::Score,
        Stage::Render,
        Stage::Persist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::ResolveTarget => "resolve_target",
            Stage::K8sContext => "k8s_context",
            Stage::Metrics => "metrics",
            Stage::Logs => "logs",
            Stage::ChangeCorrelation => "change_correlation",
            Stage::Diagnostics => "diagnostics",
            Stage::PlaybookInterpret => "playbook_interpret",
            Stage::Score => "score",
            Stage::Render => "render",
            Stage::Persist => "persist",
        }
    }

    /// Per-stage ceiling; the effective timeout is the smaller of this and
    /// whatever remains of the pipeline budget.
    pub fn cap(&self) -> Duration {
        match self {
            Stage::Normalize | Stage::ResolveTarget => Duration::from_secs(5),
            Stage::K8sContext => Duration::from_secs(15),
            Stage::Metrics | Stage::Logs => Duration::from_secs(20),
            Stage::ChangeCorrelation => Duration::from_secs(25),
            Stage::Diagnostics | Stage::PlaybookInterpret | Stage::Score | Stage::Render => {
                Duration::from_secs(5)
            }
            Stage::Persist => Duration::from_secs(20),
        }
    }
}

/* ============================= PIPELINE ============================= */

pub struct Pipeline<'a> {
    pub config: &'a Config,
    pub providers: &'a Providers,
    pub llm: Option<&'a crate::llm::LlmClient>,
}

struct Budget {
    started: Instant,
    total: Duration,
}

impl Budget {
    fn stage(&self, stage: Stage) -> Duration {
        let spent = self.started.elapsed();
        let remaining = self.total.saturating_sub(spent);
        remaining.min(stage.cap())
    }

    fn exhausted(&self) -> bool {
        self.started.elapsed() >= self.total
    }
}

impl<'a> Pipeline<'a> {
    /// Run stages 1..=10 for one job. Always returns a complete
    /// investigation; missing evidence is represented, never elided.
    /// `recurrence_24h` is the index's count of prior runs for this case
    /// in the last day (0 when the index is unavailable).
    pub async fn investigate(&self, job: &InvestigationJob, recurrence_24h: u32) -> Investigation {
        let run_started = Instant::now();
        let budget = Budget { started: run_started, total: self.config.pipeline_budget };
        let mut stage_errors: Vec<String> = Vec::new();

        // ── Stage 1: normalize ──
        let alert = &job.alert;
        let window = job.window;
        let mut identity = job.identity.clone();
        let family = job.family;
        info!(
            alert = %alert.alertname,
            family = family.as_str(),
            target = %identity.canonical(),
            "pipeline_started"
        );

        let playbook = playbooks::playbook_for(family, &identity);
        let mut evidence =
            Evidence::pending(self.config.aws.enabled, self.config.github.enabled);

        // ── Stage 2: resolve target ──
        let mut pod_exists = true;
        if let Identity::Pod { namespace, pod, .. } = identity.clone() {
            let slot = collectors_pod_probe(
                self.providers,
                &namespace,
                &pod,
                budget.stage(Stage::ResolveTarget),
            )
            .await;
            match slot {
                Slot { status: SlotStatus::Ok, data: Some(snapshot) } => {
                    // Rollout-noisy alerts re-scope to the owning workload
                    // so churned pod names collapse into one case.
                    if is_rollout_noisy(&alert.alertname, &self.config.rollout_noisy_extra) {
                        if let Some(owner) = resolve_owner(&snapshot) {
                            identity = Identity::Workload {
                                cluster: self.config.cluster_name.clone(),
                                namespace: owner.namespace.clone(),
                                kind: owner.kind.clone(),
                                owner: owner.name.clone(),
                            };
                        }
                    }
                }
                Slot { status: SlotStatus::Empty, .. } => {
                    pod_exists = false;
                }
                Slot { status: SlotStatus::Unavailable { reason }, .. } => {
                    stage_errors.push(format!("resolve_target: {reason}"));
                }
                Slot { .. } => {}
            }
        }

        // ── Stage 3: k8s context ──
        if playbook.wants(CollectorKind::K8s) && !budget.exhausted() {
            evidence.k8s =
                collect_k8s(self.providers.k8s.as_ref(), &identity, budget.stage(Stage::K8sContext))
                    .await;
        } else if budget.exhausted() {
            evidence.k8s = Slot::unavailable("stage_timeout");
            stage_errors.push("k8s_context: stage_timeout".to_string());
        }
        if !pod_exists {
            if let Identity::Pod { .. } = identity {
                // Keep the gap visible: the live pod is gone and whatever
                // context exists came from events or history.
                if let Some(k8s) = evidence.k8s.data.as_mut() {
                    k8s.pod = None;
                }
            }
        }

        // ── Stage 4: metrics ──
        if playbook.wants(CollectorKind::Metrics) && !budget.exhausted() {
            evidence.metrics = collect_metrics(
                self.providers.metrics.as_ref(),
                family,
                &identity,
                window,
                budget.stage(Stage::Metrics),
            )
            .await;
        } else if budget.exhausted() {
            evidence.metrics = Slot::unavailable("stage_timeout");
            stage_errors.push("metrics: stage_timeout".to_string());
        }

        // ── Stage 5: logs + deterministic parse ──
        if playbook.wants(CollectorKind::Logs) && !budget.exhausted() {
            evidence.logs = collect_logs(
                self.providers.logs.as_ref(),
                &identity,
                alert.container(),
                window,
                pod_exists,
                budget.stage(Stage::Logs),
            )
            .await;
        } else if budget.exhausted() {
            evidence.logs = Slot::unavailable("stage_timeout");
            stage_errors.push("logs: stage_timeout".to_string());
        }

        // ── Stage 6: change correlation ──
        if !budget.exhausted() {
            let stage_budget = budget.stage(Stage::ChangeCorrelation);
            let want_aws = playbook.wants(CollectorKind::Aws) && self.config.aws.enabled;
            let want_github = playbook.wants(CollectorKind::Github) && self.config.github.enabled;
            let (aws_slot, github_slot) = tokio::join!(
                async {
                    if want_aws {
                        Some(
                            collect_aws(self.providers.aws.as_ref(), window, self.config, stage_budget)
                                .await,
                        )
                    } else {
                        None
                    }
                },
                async {
                    if want_github {
                        Some(
                            collect_github(self.providers.github.as_ref(), window, stage_budget)
                                .await,
                        )
                    } else {
                        None
                    }
                }
            );
            if let Some(slot) = aws_slot {
                evidence.aws = Some(slot);
            }
            if let Some(slot) = github_slot {
                evidence.github = Some(slot);
            }
            evidence.change = collectors::correlate_change(&evidence, window);
        } else {
            evidence.change = Slot::unavailable("stage_timeout");
            stage_errors.push("change_correlation: stage_timeout".to_string());
        }

        // Evidence is frozen from here on.
        let blocked = blocked_scenarios(&identity, &evidence);

        // ── Stage 7: diagnostics ──
        let findings: Vec<Finding> =
            match catch_unwind(AssertUnwindSafe(|| diagnostics::run_all(&evidence))) {
                Ok(findings) => findings,
                Err(_) => {
                    stage_errors.push("diagnostics: stage_error".to_string());
                    Vec::new()
                }
            };

        // ── Stage 8: playbook interpret ──
        let input = PlaybookInput {
            alert,
            identity: &identity,
            family,
            evidence: &evidence,
            findings: &findings,
        };
        let playbook_out =
            match catch_unwind(AssertUnwindSafe(|| (playbook.interpreter)(&input))) {
                Ok(out) => Some(out),
                Err(_) => {
                    stage_errors.push("playbook_interpret: stage_error".to_string());
                    None
                }
            };

        // ── Stage 9: score & classify ──
        let hypotheses = playbook_out
            .as_ref()
            .map(|o| o.hypotheses.clone())
            .unwrap_or_default();
        let scores = scoring::score(&ScoreInputs {
            identity: &identity,
            family,
            alert,
            evidence: &evidence,
            findings: &findings,
            hypotheses: &hypotheses,
            blocked: &blocked,
            recurrence_24h,
        });

        let decision = build_decision(&identity, &evidence, &blocked, playbook_out.as_ref());
        let rca = hypotheses.first().map(|h| h.root_cause.clone());
        let mut analysis = Analysis {
            decision,
            enrichment: playbook_out.as_ref().map(|o| o.enrichment.clone()),
            features: playbook_out
                .as_ref()
                .map(|o| o.features.clone())
                .unwrap_or_else(|| serde_json::json!({})),
            verdict: playbook_out.as_ref().and_then(|o| o.verdict.clone()),
            hypotheses,
            rca,
            scores,
            change: evidence.change.data.clone(),
            blocked: blocked.clone(),
            stage_errors: stage_errors.clone(),
            llm: None,
        };

        // ── LLM enrichment (optional, after scoring, never blocking) ──
        if let Some(llm) = self.llm {
            analysis.llm = Some(
                llm.enrich(
                    &identity,
                    &evidence,
                    &analysis,
                    self.config.llm.include_logs,
                    self.config.llm.redact_infrastructure,
                )
                .await,
            );
        }

        // ── Stage 10: render ──
        let created_at = Utc::now();
        let case_id = case_id(&identity, family);
        let run_id = format!("run-{}", Uuid::new_v4());
        let report_markdown = report::render_markdown(
            &alert.alertname,
            &case_id,
            &run_id,
            &identity,
            family,
            &evidence,
            &analysis,
            created_at,
        );

        let mut investigation = Investigation {
            case_id,
            run_id,
            alert: alert.clone(),
            identity,
            family,
            evidence,
            analysis,
            report_markdown,
            report_json: serde_json::Value::Null,
            created_at,
        };
        investigation.report_json = report::render_json(&investigation);

        info!(
            case = %investigation.case_id,
            run = %investigation.run_id,
            classification = investigation.analysis.scores.classification.as_str(),
            elapsed_ms = run_started.elapsed().as_millis() as u64,
            "pipeline_finished"
        );
        if !investigation.analysis.stage_errors.is_empty() {
            warn!(
                errors = investigation.analysis.stage_errors.len(),
                "pipeline_stage_errors"
            );
        }

        investigation
    }
}

/// Light pod probe used by the resolve stage: existence + ownership only.
async fn collectors_pod_probe(
    providers: &Providers,
    namespace: &str,
    pod: &str,
    budget: Duration,
) -> Slot<crate::evidence::PodSnapshot> {
    let Some(k8s) = providers.k8s.as_ref() else {
        return Slot::unavailable("not_configured");
    };
    match tokio::time::timeout(budget, k8s.pod(namespace, pod)).await {
        Ok(slot) => slot,
        Err(_) => Slot::unavailable("timeout"),
    }
}

/* ============================= BLOCKED SCENARIOS ============================= */

/// Reasons that mean "we never asked", not "the provider failed".
fn is_passive_reason(reason: &str) -> bool {
    matches!(reason, "not_collected" | "target_identity_missing")
}

fn slot_blocked<T>(slot: &Slot<T>) -> bool {
    match &slot.status {
        SlotStatus::Unavailable { reason } => !is_passive_reason(reason),
        _ => false,
    }
}

pub fn blocked_scenarios(identity: &Identity, evidence: &Evidence) -> Vec<BlockedScenario> {
    let mut blocked = Vec::new();
    if matches!(identity, Identity::Unknown) {
        blocked.push(BlockedScenario::TargetIdentityMissing);
    }
    if slot_blocked(&evidence.k8s) {
        blocked.push(BlockedScenario::K8sUnavailable);
    }
    if slot_blocked(&evidence.logs) {
        blocked.push(BlockedScenario::LogsUnavailable);
    }
    if slot_blocked(&evidence.metrics) {
        blocked.push(BlockedScenario::MetricsUnavailable);
    }
    blocked
}

/* ============================= DECISION ============================= */

fn build_decision(
    identity: &Identity,
    evidence: &Evidence,
    blocked: &[BlockedScenario],
    playbook_out: Option<&playbooks::PlaybookOutput>,
) -> Decision {
    let mut why: Vec<String> = Vec::new();
    let mut next: Vec<String> = Vec::new();

    let label = if blocked.contains(&BlockedScenario::TargetIdentityMissing) {
        why.push("the alert carries no namespace/pod/workload labels".to_string());
        "target identity unknown, cannot scope the triage".to_string()
    } else {
        match playbook_out {
            Some(out) => {
                why.extend(out.enrichment.why.clone());
                next.extend(out.enrichment.next.clone());
                out.enrichment.label.clone()
            }
            None => {
                why.push("playbook interpreter failed; see stage errors".to_string());
                "triage incomplete".to_string()
            }
        }
    };

    // Every blocked scenario contributes a concrete recovery step.
    for scenario in blocked {
        let step = match scenario {
            BlockedScenario::TargetIdentityMissing => {
                "kubectl get pods -A --field-selector status.phase!=Running".to_string()
            }
            BlockedScenario::K8sUnavailable => "kubectl cluster-info".to_string(),
            BlockedScenario::LogsUnavailable => match identity {
                Identity::Pod { namespace, pod, .. } => {
                    format!("kubectl logs {pod} -n {namespace} --since=1h")
                }
                _ => "kubectl logs <pod> -n <namespace> --since=1h".to_string(),
            },
            BlockedScenario::MetricsUnavailable => {
                "curl -sS \"$PROMETHEUS_URL/api/v1/query?query=up\" | head -c 400".to_string()
            }
        };
        if !next.contains(&step) {
            next.push(step);
        }
    }

    if why.is_empty() {
        why.extend(evidence.status_lines());
    }

    Decision { label, why, next }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Evidence;

    #[test]
    fn test_stage_order_and_names() {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.len(), 11);
        assert_eq!(names[0], "normalize");
        assert_eq!(names[10], "persist");
    }

    #[test]
    fn test_blocked_scenarios_from_slots() {
        let mut evidence = Evidence::pending(false, false);
        evidence.k8s = Slot::unavailable("timeout");
        evidence.logs = Slot::unavailable("http_error:503");
        evidence.metrics = Slot::unavailable("not_collected");

        let blocked = blocked_scenarios(
            &Identity::Pod { cluster: "c".into(), namespace: "n".into(), pod: "p".into() },
            &evidence,
        );
        assert!(blocked.contains(&BlockedScenario::K8sUnavailable));
        assert!(blocked.contains(&BlockedScenario::LogsUnavailable));
        assert!(
            !blocked.contains(&BlockedScenario::MetricsUnavailable),
            "not_collected is passive, not a blocked scenario"
        );
    }

    #[test]
    fn test_unknown_identity_is_scenario_a() {
        let evidence = Evidence::pending(false, false);
        let blocked = blocked_scenarios(&Identity::Unknown, &evidence);
        assert!(blocked.contains(&BlockedScenario::TargetIdentityMissing));
    }

    #[test]
    fn test_decision_for_scenario_a_names_the_gap_and_a_command() {
        let evidence = Evidence::pending(false, false);
        let blocked = vec![BlockedScenario::TargetIdentityMissing];
        let decision = build_decision(&Identity::Unknown, &evidence, &blocked, None);
        assert!(decision.label.contains("target identity unknown"));
        assert!(decision.next.iter().any(|n| n.starts_with("kubectl ")));
    }

    #[test]
    fn test_decision_logs_unavailable_offers_fallback_command() {
        let mut evidence = Evidence::pending(false, false);
        evidence.logs = Slot::unavailable("http_error:503");
        let identity =
            Identity::Pod { cluster: "c".into(), namespace: "prod".into(), pod: "web-abc".into() };
        let blocked = blocked_scenarios(&identity, &evidence);
        let decision = build_decision(&identity, &evidence, &blocked, None);
        assert!(
            decision
                .next
                .iter()
                .any(|n| n.contains("kubectl logs web-abc -n prod"))
        );
    }

    #[test]
    fn test_stage_budget_respects_remaining_time() {
        let budget = Budget {
            started: Instant::now(),
            total: Duration::from_secs(2),
        };
        assert!(budget.stage(Stage::Metrics) <= Duration::from_secs(2));
        assert!(budget.stage(Stage::Normalize) <= Duration::from_secs(2));
    }
}
