//! Optional LLM enrichment.
//!
//! Runs after scoring on a redacted copy of the evidence and can only add
//! a summary layer; deterministic fields are never touched. Any failure is
//! recorded on `analysis.llm.status` and the pipeline proceeds.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::LlmConfig;
use crate::evidence::Evidence;
use crate::model::{Analysis, Identity, LlmEnrichment};
use crate::redact::{Tier, redact_value};

const LLM_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You are an SRE assistant summarizing a finished, \
deterministic alert investigation. Use only the evidence given. If something \
is marked unavailable, say it is unknown; never invent identities, scope, or \
impact. Reply with a JSON object: {\"summary\", \"likely_root_cause\", \
\"confidence\" (0..1), \"next_steps\" (array of strings)}.";

pub struct LlmClient {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> Option<LlmClient> {
        if !config.enabled {
            return None;
        }
        let url = config.url.clone()?;
        Some(LlmClient {
            http: reqwest::Client::builder()
                .timeout(LLM_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            url: url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Produce the enrichment, or a status-only record when the call
    /// fails. Never returns an error.
    pub async fn enrich(
        &self,
        identity: &Identity,
        evidence: &Evidence,
        analysis: &Analysis,
        include_logs: bool,
        redact_infrastructure: bool,
    ) -> LlmEnrichment {
        let payload = build_payload(identity, evidence, analysis, include_logs, redact_infrastructure);

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": payload.to_string() },
            ],
            "temperature": 0.0,
        });

        let mut req = self.http.post(format!("{}/chat/completions", self.url)).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "llm_request_failed");
                return failed(format!("llm_request_failed:{}", crate::providers::classify_reqwest(&e)));
            }
        };
        if !resp.status().is_success() {
            return failed(format!("llm_http_error:{}", resp.status().as_u16()));
        }

        let completion: ChatCompletion = match resp.json().await {
            Ok(c) => c,
            Err(_) => return failed("llm_malformed_response".to_string()),
        };
        let Some(content) = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
        else {
            return failed("llm_empty_response".to_string());
        };

        match parse_enrichment(content) {
            Some(enrichment) => enrichment,
            None => failed("llm_unparseable_content".to_string()),
        }
    }
}

fn failed(status: String) -> LlmEnrichment {
    LlmEnrichment {
        status,
        summary: None,
        likely_root_cause: None,
        confidence: None,
        next_steps: Vec::new(),
    }
}

/// Redacted evidence payload. Logs are included only when configured, and
/// infrastructure identifiers are masked unless explicitly kept.
fn build_payload(
    identity: &Identity,
    evidence: &Evidence,
    analysis: &Analysis,
    include_logs: bool,
    redact_infrastructure: bool,
) -> serde_json::Value {
    let tier = if redact_infrastructure {
        Tier::SecretsAndInfrastructure
    } else {
        Tier::Secrets
    };

    let mut evidence_json = serde_json::to_value(evidence).unwrap_or_else(|_| json!({}));
    if !include_logs {
        if let Some(logs) = evidence_json.get_mut("logs") {
            if let Some(data) = logs.get_mut("data") {
                if let Some(obj) = data.as_object_mut() {
                    // Parsed patterns stay; raw lines do not leave the process.
                    obj.remove("entries");
                }
            }
        }
    }

    redact_value(
        &json!({
            "target": identity.canonical(),
            "evidence": evidence_json,
            "decision": &analysis.decision,
            "findings_verdict": &analysis.verdict,
            "scores": analysis.scores,
        }),
        tier,
    )
}

fn parse_enrichment(content: &str) -> Option<LlmEnrichment> {
    // Models occasionally wrap the JSON in a code fence.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let parsed: ParsedEnrichment = serde_json::from_str(trimmed).ok()?;
    Some(LlmEnrichment {
        status: "ok".to_string(),
        summary: parsed.summary,
        likely_root_cause: parsed.likely_root_cause,
        confidence: parsed.confidence.map(|c| c.clamp(0.0, 1.0)),
        next_steps: parsed.next_steps,
    })
}

/* ============================= WIRE TYPES ============================= */

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ParsedEnrichment {
    summary: Option<String>,
    likely_root_cause: Option<String>,
    confidence: Option<f64>,
    #[serde(default)]
    next_steps: Vec<String>,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classification, Decision, Scores};

    #[test]
    fn test_parse_enrichment_plain_and_fenced() {
        let plain = r#"{"summary":"s","likely_root_cause":"r","confidence":0.8,"next_steps":["a"]}"#;
        let parsed = parse_enrichment(plain).unwrap();
        assert_eq!(parsed.status, "ok");
        assert_eq!(parsed.confidence, Some(0.8));

        let fenced = format!("```json\n{plain}\n```");
        assert!(parse_enrichment(&fenced).is_some());
    }

    #[test]
    fn test_parse_enrichment_clamps_confidence() {
        let over = r#"{"summary":null,"likely_root_cause":null,"confidence":3.5,"next_steps":[]}"#;
        assert_eq!(parse_enrichment(over).unwrap().confidence, Some(1.0));
    }

    #[test]
    fn test_parse_enrichment_rejects_garbage() {
        assert!(parse_enrichment("the root cause is probably DNS").is_none());
    }

    #[test]
    fn test_payload_excludes_raw_logs_by_default() {
        let mut evidence = Evidence::pending(false, false);
        evidence.logs = crate::evidence::Slot::ok(crate::evidence::LogsEvidence {
            backend: "loki".into(),
            query: "q".into(),
            entries: vec![crate::evidence::LogEntry {
                timestamp: None,
                line: "password=topsecret".into(),
            }],
            parsed_patterns: vec![],
            historical_fallback: false,
        });
        let analysis = Analysis {
            decision: Decision { label: "l".into(), why: vec![], next: vec![] },
            enrichment: None,
            features: serde_json::json!({}),
            verdict: None,
            hypotheses: vec![],
            rca: None,
            scores: Scores {
                impact: 0,
                confidence: 0,
                noise: 0,
                classification: Classification::Informational,
            },
            change: None,
            blocked: vec![],
            stage_errors: vec![],
            llm: None,
        };

        let payload = build_payload(&Identity::Unknown, &evidence, &analysis, false, true);
        let text = payload.to_string();
        assert!(!text.contains("topsecret"));
        assert!(!text.contains("entries"));
    }

    #[test]
    fn test_payload_redacts_included_logs() {
        let mut evidence = Evidence::pending(false, false);
        evidence.logs = crate::evidence::Slot::ok(crate::evidence::LogsEvidence {
            backend: "loki".into(),
            query: "q".into(),
            entries: vec![crate::evidence::LogEntry {
                timestamp: None,
                line: "password=topsecret".into(),
            }],
            parsed_patterns: vec![],
            historical_fallback: false,
        });
        let analysis = Analysis {
            decision: Decision { label: "l".into(), why: vec![], next: vec![] },
            enrichment: None,
            features: serde_json::json!({}),
            verdict: None,
            hypotheses: vec![],
            rca: None,
            scores: Scores {
                impact: 0,
                confidence: 0,
                noise: 0,
                classification: Classification::Informational,
            },
            change: None,
            blocked: vec![],
            stage_errors: vec![],
            llm: None,
        };

        let payload = build_payload(&Identity::Unknown, &evidence, &analysis, true, false);
        assert!(!payload.to_string().contains("topsecret"));
    }
}
