//! Report rendering.
//!
//! Identical inputs produce byte-identical Markdown and JSON. Section
//! order and headings are part of the contract with the console UI, which
//! parses sections by heading. Next-step lines that look like commands are
//! wrapped in fenced code blocks; everything else renders as a list item.

use std::fmt::Write as _;

use crate::evidence::{Evidence, SlotStatus};
use crate::model::{Analysis, Family, Identity, Investigation};

/* ============================= COMMAND DETECTION ============================= */

const COMMAND_PREFIXES: &[&str] = &["kubectl ", "aws ", "curl ", "nats ", "gh "];

/// Fence language for a recognized command line, or None for prose.
fn command_language(line: &str) -> Option<&'static str> {
    if line.starts_with("promql: ") {
        Some("promql")
    } else if line.starts_with("logql: ") {
        Some("logql")
    } else if COMMAND_PREFIXES.iter().any(|p| line.starts_with(p)) {
        Some("bash")
    } else {
        None
    }
}

fn push_next_step(out: &mut String, line: &str) {
    match command_language(line) {
        Some(lang) => {
            let body = line
                .strip_prefix("promql: ")
                .or_else(|| line.strip_prefix("logql: "))
                .unwrap_or(line);
            let _ = writeln!(out, "```{lang}\n{body}\n```");
        }
        None => {
            let _ = writeln!(out, "- {line}");
        }
    }
}

/* ============================= MARKDOWN ============================= */

pub fn render_markdown(
    alertname: &str,
    case_id: &str,
    run_id: &str,
    identity: &Identity,
    family: Family,
    evidence: &Evidence,
    analysis: &Analysis,
    created_at: chrono::DateTime<chrono::Utc>,
) -> String {
    let mut out = String::with_capacity(4096);

    // ── Header ──
    let _ = writeln!(out, "# Investigation: {alertname}");
    let _ = writeln!(out);
    let _ = writeln!(out, "- case: `{case_id}`");
    let _ = writeln!(out, "- run: `{run_id}`");
    let _ = writeln!(out, "- target: `{}`", identity.canonical());
    let _ = writeln!(out, "- family: `{}`", family.as_str());
    let _ = writeln!(
        out,
        "- created: {}",
        created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let _ = writeln!(out);

    // ── Verdict ──
    let _ = writeln!(out, "## Verdict");
    let _ = writeln!(out);
    match &analysis.verdict {
        Some(v) => {
            let _ = writeln!(out, "{v}");
        }
        None => {
            let _ = writeln!(out, "No verdict could be established from the available evidence.");
        }
    }
    let _ = writeln!(out);

    // ── Decision ──
    let _ = writeln!(out, "## Decision");
    let _ = writeln!(out);
    let _ = writeln!(out, "**{}**", analysis.decision.label);
    let _ = writeln!(out);
    for why in &analysis.decision.why {
        let _ = writeln!(out, "- {why}");
    }
    let _ = writeln!(out);

    // ── Blocked scenarios, when present ──
    if !analysis.blocked.is_empty() {
        let _ = writeln!(out, "## Blocked evidence");
        let _ = writeln!(out);
        for b in &analysis.blocked {
            let text = match b {
                crate::model::BlockedScenario::TargetIdentityMissing => {
                    "target identity unknown: the alert carries no usable target labels"
                }
                crate::model::BlockedScenario::K8sUnavailable => {
                    "Kubernetes API unavailable: pod and workload state could not be read"
                }
                crate::model::BlockedScenario::LogsUnavailable => {
                    "logs unavailable (distinct from empty): the log backend did not answer"
                }
                crate::model::BlockedScenario::MetricsUnavailable => {
                    "metrics scope unavailable: blast radius is unknown"
                }
            };
            let _ = writeln!(out, "- {text}");
        }
        let _ = writeln!(out);
    }

    // ── Evidence ──
    let _ = writeln!(out, "## Evidence");
    let _ = writeln!(out);
    for line in evidence.status_lines() {
        let _ = writeln!(out, "- {line}");
    }
    let _ = writeln!(out);
    render_evidence_details(&mut out, evidence);

    // ── Findings ──
    let _ = writeln!(out, "## Findings");
    let _ = writeln!(out);
    // Findings surface through hypotheses and the decision; the raw list
    // is kept for operators drilling down.
    if analysis.hypotheses.is_empty() && analysis.enrichment.is_none() {
        let _ = writeln!(out, "No diagnostic module produced a finding.");
        let _ = writeln!(out);
    }
    if let Some(enrichment) = &analysis.enrichment {
        let _ = writeln!(out, "**{}**", enrichment.label);
        let _ = writeln!(out);
        for why in &enrichment.why {
            let _ = writeln!(out, "- {why}");
        }
        let _ = writeln!(out);
    }

    // ── Hypotheses ──
    let _ = writeln!(out, "## Hypotheses");
    let _ = writeln!(out);
    if analysis.hypotheses.is_empty() {
        let _ = writeln!(out, "None.");
        let _ = writeln!(out);
    }
    for h in &analysis.hypotheses {
        let _ = writeln!(
            out,
            "### {} (confidence {:.2})",
            h.root_cause, h.confidence_0_1
        );
        let _ = writeln!(out);
        for e in &h.evidence {
            let _ = writeln!(out, "- evidence: {e}");
        }
        for r in &h.remediation {
            let _ = writeln!(out, "- remediation: {r}");
        }
        for u in &h.unknowns {
            let _ = writeln!(out, "- unknown: {u}");
        }
        let _ = writeln!(out);
    }

    // ── Scores ──
    let _ = writeln!(out, "## Scores");
    let _ = writeln!(out);
    let s = &analysis.scores;
    let _ = writeln!(out, "| impact | confidence | noise | classification |");
    let _ = writeln!(out, "|--------|------------|-------|----------------|");
    let _ = writeln!(
        out,
        "| {} | {} | {} | {} |",
        s.impact,
        s.confidence,
        s.noise,
        s.classification.as_str()
    );
    let _ = writeln!(out);

    // ── Change correlation ──
    let _ = writeln!(out, "## Change correlation");
    let _ = writeln!(out);
    match &analysis.change {
        Some(change) => {
            if let Some(summary) = &change.summary {
                let _ = writeln!(out, "Latest change: {summary}");
            }
            if let (Some(ts), Some(source)) = (&change.last_change_time, &change.source) {
                let _ = writeln!(
                    out,
                    "Seen at {} via {source}.",
                    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                );
            }
            let _ = writeln!(out);
            for signal in &change.signals {
                let _ = writeln!(out, "- {signal}");
            }
        }
        None => {
            let _ = writeln!(out, "No change signals inside the window.");
        }
    }
    let _ = writeln!(out);

    // ── Next steps ──
    let _ = writeln!(out, "## Next steps");
    let _ = writeln!(out);
    if analysis.decision.next.is_empty() {
        let _ = writeln!(out, "None.");
    }
    for step in &analysis.decision.next {
        push_next_step(&mut out, step);
    }
    let _ = writeln!(out);

    // ── LLM summary, when enabled ──
    if let Some(llm) = &analysis.llm {
        let _ = writeln!(out, "## Assistant summary");
        let _ = writeln!(out);
        let _ = writeln!(out, "status: {}", llm.status);
        if let Some(summary) = &llm.summary {
            let _ = writeln!(out);
            let _ = writeln!(out, "{summary}");
        }
        let _ = writeln!(out);
    }

    // ── Provenance ──
    let _ = writeln!(out, "## Provenance");
    let _ = writeln!(out);
    for err in &analysis.stage_errors {
        let _ = writeln!(out, "- stage error: {err}");
    }
    let _ = writeln!(
        out,
        "- generated by tarka {} from read-only evidence",
        env!("CARGO_PKG_VERSION")
    );

    out
}

fn render_evidence_details(out: &mut String, evidence: &Evidence) {
    if let Some(pod) = evidence.pod() {
        let _ = writeln!(out, "### Pod");
        let _ = writeln!(out);
        let _ = writeln!(out, "- `{}/{}` phase {}", pod.namespace, pod.name, pod.phase);
        for c in &pod.containers {
            let state = match &c.state {
                crate::evidence::ContainerState::Running => "Running".to_string(),
                crate::evidence::ContainerState::Waiting { reason } => format!("Waiting ({reason})"),
                crate::evidence::ContainerState::Terminated { reason, exit_code } => {
                    format!("Terminated ({reason}, exit {exit_code})")
                }
                crate::evidence::ContainerState::Unknown => "Unknown".to_string(),
            };
            let _ = writeln!(
                out,
                "- container `{}`: {state}, {} restarts",
                c.name, c.restart_count
            );
        }
        let _ = writeln!(out);
    }

    if let Some(workload) = evidence.workload() {
        let _ = writeln!(out, "### Workload");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "- `{}`: {}/{} replicas available",
            workload.workload.key(),
            workload.replicas_available,
            workload.replicas_desired
        );
        let _ = writeln!(out);
    }

    if let Some(job) = evidence.job() {
        let _ = writeln!(out, "### Job");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "- `{}/{}`: {} failed, backoffLimit {}",
            job.namespace, job.name, job.failed, job.backoff_limit
        );
        let _ = writeln!(out);
    }

    if let Some(metrics) = evidence.metrics.get() {
        if !metrics.series.is_empty() {
            let _ = writeln!(out, "### Metrics");
            let _ = writeln!(out);
            for (name, series) in &metrics.series {
                match series.latest {
                    Some(v) => {
                        let _ = writeln!(out, "- `{name}` = {v:.3}");
                    }
                    None => {
                        let _ = writeln!(out, "- `{name}` = no samples");
                    }
                }
            }
            let _ = writeln!(out);
        }
    }

    if let Some(logs) = evidence.logs.get() {
        let _ = writeln!(out, "### Logs");
        let _ = writeln!(out);
        let source = if logs.historical_fallback {
            format!("{} (historical pod-prefix fallback)", logs.backend)
        } else {
            logs.backend.clone()
        };
        let _ = writeln!(out, "- backend: {source}");
        let _ = writeln!(out, "- entries: {}", logs.entries.len());
        for p in logs.parsed_patterns.iter().take(8) {
            let _ = writeln!(
                out,
                "- [{}] x{}: {}",
                p.pattern_kind.as_str(),
                p.count,
                p.representative_line
            );
        }
        let _ = writeln!(out);
    } else if matches!(evidence.logs.status, SlotStatus::Unavailable { .. }) {
        let _ = writeln!(out, "### Logs");
        let _ = writeln!(out);
        let _ = writeln!(out, "- {}", evidence.logs.status.describe());
        let _ = writeln!(out);
    }
}

/* ============================= JSON ============================= */

/// Structured twin of the Markdown report. Field order is fixed by the
/// struct definitions; maps are BTree-backed, so serialization is stable.
pub fn render_json(investigation: &Investigation) -> serde_json::Value {
    serde_json::json!({
        "case_id": &investigation.case_id,
        "run_id": &investigation.run_id,
        "alert": &investigation.alert,
        "identity": &investigation.identity,
        "family": investigation.family,
        "evidence": &investigation.evidence,
        "analysis": &investigation.analysis,
        "created_at": investigation
            .created_at
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    })
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AlertStatus, BlockedScenario, Classification, Decision, Scores,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn minimal_analysis() -> Analysis {
        Analysis {
            decision: Decision {
                label: "target identity unknown".into(),
                why: vec!["the alert has no namespace or pod labels".into()],
                next: vec![
                    "kubectl get pods -A | grep <suspected-name>".into(),
                    "inspect the alert rule's labels".into(),
                    "promql: up == 0".into(),
                ],
            },
            enrichment: None,
            features: serde_json::json!({}),
            verdict: None,
            hypotheses: vec![],
            rca: None,
            scores: Scores {
                impact: 5,
                confidence: 10,
                noise: 15,
                classification: Classification::Artifact,
            },
            change: None,
            blocked: vec![BlockedScenario::TargetIdentityMissing],
            stage_errors: vec![],
            llm: None,
        }
    }

    fn render_minimal() -> String {
        render_markdown(
            "SomethingBroke",
            "case-abc-generic",
            "run-1",
            &Identity::Unknown,
            Family::Generic,
            &Evidence::pending(false, false),
            &minimal_analysis(),
            Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render_minimal(), render_minimal());
    }

    #[test]
    fn test_section_order_is_fixed() {
        let md = render_minimal();
        let sections = [
            "# Investigation:",
            "## Verdict",
            "## Decision",
            "## Evidence",
            "## Findings",
            "## Hypotheses",
            "## Scores",
            "## Change correlation",
            "## Next steps",
            "## Provenance",
        ];
        let mut last = 0;
        for section in sections {
            let pos = md.find(section).unwrap_or_else(|| panic!("missing section {section}"));
            assert!(pos >= last, "section {section} out of order");
            last = pos;
        }
    }

    #[test]
    fn test_commands_are_fenced() {
        let md = render_minimal();
        assert!(md.contains("```bash\nkubectl get pods -A | grep <suspected-name>\n```"));
        assert!(md.contains("```promql\nup == 0\n```"));
        assert!(md.contains("- inspect the alert rule's labels"));
    }

    #[test]
    fn test_blocked_scenario_section_present() {
        let md = render_minimal();
        assert!(md.contains("## Blocked evidence"));
        assert!(md.contains("target identity unknown"));
    }

    #[test]
    fn test_command_language_detection() {
        assert_eq!(command_language("kubectl get pods"), Some("bash"));
        assert_eq!(command_language("aws ec2 describe-instances"), Some("bash"));
        assert_eq!(command_language("promql: up == 0"), Some("promql"));
        assert_eq!(command_language("logql: {namespace=\"x\"}"), Some("logql"));
        assert_eq!(command_language("check the dashboard"), None);
    }

    #[test]
    fn test_json_report_round_trips_analysis() {
        let analysis = minimal_analysis();
        let json = serde_json::to_value(&analysis).unwrap();
        let back: Analysis = serde_json::from_value(json).unwrap();
        assert_eq!(analysis, back);
    }

    #[test]
    fn test_logs_unavailable_rendered_with_reason() {
        let mut evidence = Evidence::pending(false, false);
        evidence.logs = crate::evidence::Slot::unavailable("http_error:503");
        let md = render_markdown(
            "X",
            "c",
            "r",
            &Identity::Unknown,
            Family::Generic,
            &evidence,
            &minimal_analysis(),
            Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
        );
        assert!(md.contains("logs=unavailable (http_error:503)"));
    }

    #[test]
    fn test_alert_serde_for_json_twin() {
        let alert = crate::model::AlertInstance {
            fingerprint: "f".into(),
            alertname: "A".into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
            ends_at: None,
            status: AlertStatus::Firing,
        };
        let v = serde_json::to_value(&alert).unwrap();
        assert_eq!(v["status"], "firing");
    }
}
