mod common;

use chrono::{TimeZone, Utc};
use common::{crashloop_oom_evidence, make_alert};
use tarka::evidence::{Evidence, LogsEvidence, Slot, SlotStatus};
use tarka::model::{Analysis, Classification, Decision, Family, Identity, Scores};
use tarka::pipeline::blocked_scenarios;
use tarka::report::{render_json, render_markdown};

// ══════════════════════════════════════════════════════════════════
// Report contract tests
//
// The console parses reports by section heading and pre-computes object
// keys, so the Markdown layout and the JSON twin are contracts:
// byte-determinism, fixed section order, fenced commands, and the
// empty-vs-unavailable logs distinction.
// ══════════════════════════════════════════════════════════════════

fn analysis_for(evidence: &Evidence, identity: &Identity) -> Analysis {
    let findings = tarka::diagnostics::run_all(evidence);
    let alert = make_alert("KubernetesPodNotHealthy", &[("namespace", "prod"), ("pod", "web-abc")]);
    let playbook = tarka::playbooks::playbook_for(Family::PodNotHealthy, identity);
    let out = (playbook.interpreter)(&tarka::playbooks::PlaybookInput {
        alert: &alert,
        identity,
        family: Family::PodNotHealthy,
        evidence,
        findings: &findings,
    });
    let blocked = blocked_scenarios(identity, evidence);
    let scores = tarka::scoring::score(&tarka::scoring::ScoreInputs {
        identity,
        family: Family::PodNotHealthy,
        alert: &alert,
        evidence,
        findings: &findings,
        hypotheses: &out.hypotheses,
        blocked: &blocked,
        recurrence_24h: 0,
    });
    Analysis {
        decision: Decision {
            label: out.enrichment.label.clone(),
            why: out.enrichment.why.clone(),
            next: out.enrichment.next.clone(),
        },
        enrichment: Some(out.enrichment),
        features: out.features,
        verdict: out.verdict,
        hypotheses: out.hypotheses,
        rca: None,
        scores,
        change: None,
        blocked,
        stage_errors: vec![],
        llm: None,
    }
}

fn render_fixture() -> String {
    let evidence = crashloop_oom_evidence();
    let identity =
        Identity::Pod { cluster: "main".into(), namespace: "prod".into(), pod: "web-abc".into() };
    let analysis = analysis_for(&evidence, &identity);
    render_markdown(
        "KubernetesPodNotHealthy",
        "case-abc-pod_not_healthy",
        "run-fixed",
        &identity,
        Family::PodNotHealthy,
        &evidence,
        &analysis,
        Utc.with_ymd_and_hms(2026, 7, 1, 12, 5, 0).unwrap(),
    )
}

#[test]
fn test_render_byte_identical_across_calls() {
    assert_eq!(render_fixture(), render_fixture());
}

#[test]
fn test_render_stable_under_metric_insertion_order() {
    // Metrics are keyed by name in a BTreeMap: producers may run in any
    // order without changing the serialized form.
    let forward = crashloop_oom_evidence();
    let mut reversed = crashloop_oom_evidence();
    let series = reversed.metrics.data.as_mut().unwrap();
    let entries: Vec<_> = series.series.clone().into_iter().rev().collect();
    series.series = entries.into_iter().collect();

    let identity =
        Identity::Pod { cluster: "main".into(), namespace: "prod".into(), pod: "web-abc".into() };
    let a = analysis_for(&forward, &identity);
    let b = analysis_for(&reversed, &identity);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn test_logs_empty_vs_unavailable_are_distinct_in_report() {
    let identity =
        Identity::Pod { cluster: "main".into(), namespace: "prod".into(), pod: "web-abc".into() };

    // HTTP 200 with no entries: empty.
    let mut evidence = crashloop_oom_evidence();
    evidence.logs = Slot {
        status: SlotStatus::Empty,
        data: Some(LogsEvidence {
            backend: "loki".into(),
            query: "{namespace=\"prod\",pod=\"web-abc\"}".into(),
            entries: vec![],
            parsed_patterns: vec![],
            historical_fallback: false,
        }),
    };
    let analysis = analysis_for(&evidence, &identity);
    let md = render_markdown(
        "KubernetesPodNotHealthy",
        "c",
        "r",
        &identity,
        Family::PodNotHealthy,
        &evidence,
        &analysis,
        Utc.with_ymd_and_hms(2026, 7, 1, 12, 5, 0).unwrap(),
    );
    assert!(md.contains("logs=empty"), "empty must be reported as empty");
    assert!(!analysis.blocked.iter().any(|b| matches!(b, tarka::model::BlockedScenario::LogsUnavailable)));

    // HTTP 503: unavailable with the classified reason.
    let mut evidence = crashloop_oom_evidence();
    evidence.logs = Slot::unavailable("http_error:503");
    let analysis = analysis_for(&evidence, &identity);
    let md = render_markdown(
        "KubernetesPodNotHealthy",
        "c",
        "r",
        &identity,
        Family::PodNotHealthy,
        &evidence,
        &analysis,
        Utc.with_ymd_and_hms(2026, 7, 1, 12, 5, 0).unwrap(),
    );
    assert!(md.contains("logs=unavailable (http_error:503)"));
    assert!(analysis.blocked.iter().any(|b| matches!(b, tarka::model::BlockedScenario::LogsUnavailable)));
}

#[test]
fn test_json_twin_round_trips() {
    let evidence = crashloop_oom_evidence();
    let identity =
        Identity::Pod { cluster: "main".into(), namespace: "prod".into(), pod: "web-abc".into() };
    let analysis = analysis_for(&evidence, &identity);
    let alert = make_alert("KubernetesPodNotHealthy", &[("namespace", "prod"), ("pod", "web-abc")]);

    let investigation = tarka::model::Investigation {
        case_id: tarka::model::case_id(&identity, Family::PodNotHealthy),
        run_id: "run-fixed".into(),
        alert,
        identity: identity.clone(),
        family: Family::PodNotHealthy,
        evidence,
        analysis,
        report_markdown: String::new(),
        report_json: serde_json::Value::Null,
        created_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 5, 0).unwrap(),
    };

    let json = render_json(&investigation);
    assert_eq!(json["case_id"], investigation.case_id.as_str());
    assert_eq!(json["family"], "pod_not_healthy");

    // Analysis serde round-trip.
    let back: Analysis = serde_json::from_value(json["analysis"].clone()).unwrap();
    assert_eq!(back, investigation.analysis);
}

#[test]
fn test_scores_render_as_integers() {
    let md = render_fixture();
    let scores_section = md.split("## Scores").nth(1).unwrap();
    let row = scores_section.lines().nth(4).unwrap_or_default();
    assert!(row.starts_with("| "), "score row present: {row}");
    assert!(!row.contains('.'), "scores must render as integers: {row}");
}

#[test]
fn test_artifact_analysis_always_has_scores() {
    // Even a fully-blocked artifact report carries populated scores.
    let evidence = Evidence::pending(false, false);
    let identity = Identity::Unknown;
    let blocked = blocked_scenarios(&identity, &evidence);
    let scores = tarka::scoring::score(&tarka::scoring::ScoreInputs {
        identity: &identity,
        family: Family::Generic,
        alert: &make_alert("X", &[]),
        evidence: &evidence,
        findings: &[],
        hypotheses: &[],
        blocked: &blocked,
        recurrence_24h: 0,
    });
    assert_eq!(scores.classification, Classification::Artifact);
    let _always_present: Scores = scores;
}
