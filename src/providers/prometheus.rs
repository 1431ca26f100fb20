use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{classify_reqwest, classify_status, Slot};
use crate::evidence::MetricSeries;

/* ============================= CLIENT ============================= */

const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct MetricsProvider {
    http: reqwest::Client,
    base_url: String,
}

impl MetricsProvider {
    pub fn new(base_url: &str) -> MetricsProvider {
        MetricsProvider {
            http: reqwest::Client::builder()
                .timeout(QUERY_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Instant query at a point in time. `Empty` when Prometheus answers
    /// with no samples.
    pub async fn instant(&self, query: &str, at: DateTime<Utc>) -> Slot<f64> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("query", query), ("time", &at.timestamp().to_string())])
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => return Slot::unavailable(classify_reqwest(&e)),
        };
        if !resp.status().is_success() {
            return Slot::unavailable(classify_status(resp.status().as_u16()));
        }

        let body: PromResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => return Slot::unavailable(classify_reqwest(&e)),
        };
        if body.status != "success" {
            return Slot::unavailable(format!("http_error:prom_{}", body.status));
        }

        match body.data.result.first().and_then(PromResult::instant_value) {
            Some(v) => Slot::ok(v),
            None => Slot::empty(),
        }
    }

    /// Range query over a window, returning ascending (unix, value) samples.
    pub async fn range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_seconds: u64,
    ) -> Slot<MetricSeries> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("query", query),
                ("start", &start.timestamp().to_string()),
                ("end", &end.timestamp().to_string()),
                ("step", &step_seconds.to_string()),
            ])
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => return Slot::unavailable(classify_reqwest(&e)),
        };
        if !resp.status().is_success() {
            return Slot::unavailable(classify_status(resp.status().as_u16()));
        }

        let body: PromResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => return Slot::unavailable(classify_reqwest(&e)),
        };
        if body.status != "success" {
            return Slot::unavailable(format!("http_error:prom_{}", body.status));
        }

        let mut points: Vec<(i64, f64)> = body
            .data
            .result
            .iter()
            .flat_map(PromResult::range_values)
            .collect();
        points.sort_by_key(|(ts, _)| *ts);

        if points.is_empty() {
            return Slot::empty();
        }
        let latest = points.last().map(|(_, v)| *v);
        Slot::ok(MetricSeries { query: query.to_string(), points, latest })
    }
}

/* ============================= LABEL INJECTION ============================= */

/// Build the label-matcher body for a PromQL selector, e.g.
/// `namespace="prod",pod="web-abc"`. Empty parts are omitted.
pub fn label_matchers(namespace: Option<&str>, pod: Option<&str>, container: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(ns) = namespace {
        parts.push(format!("namespace=\"{ns}\""));
    }
    if let Some(p) = pod {
        parts.push(format!("pod=\"{p}\""));
    }
    if let Some(c) = container {
        parts.push(format!("container=\"{c}\""));
    }
    parts.join(",")
}

/// Pod-prefix variant used when the exact pod is gone and only the
/// workload-derived prefix is known.
pub fn label_matchers_prefix(namespace: &str, pod_prefix: &str) -> String {
    format!("namespace=\"{namespace}\",pod=~\"{pod_prefix}.*\"")
}

/* ============================= WIRE TYPES ============================= */

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: PromData,
}

#[derive(Debug, Default, Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromResult>,
}

#[derive(Debug, Deserialize)]
struct PromResult {
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl PromResult {
    fn instant_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(|(_, v)| v.parse().ok())
    }

    fn range_values(&self) -> Vec<(i64, f64)> {
        self.values
            .iter()
            .filter_map(|(ts, v)| v.parse::<f64>().ok().map(|val| (*ts as i64, val)))
            .collect()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_matchers_full() {
        assert_eq!(
            label_matchers(Some("prod"), Some("web-abc"), Some("app")),
            "namespace=\"prod\",pod=\"web-abc\",container=\"app\""
        );
    }

    #[test]
    fn test_label_matchers_partial() {
        assert_eq!(label_matchers(Some("prod"), None, None), "namespace=\"prod\"");
        assert_eq!(label_matchers(None, None, None), "");
    }

    #[test]
    fn test_label_matchers_prefix() {
        assert_eq!(
            label_matchers_prefix("batch", "nightly-sync"),
            "namespace=\"batch\",pod=~\"nightly-sync.*\""
        );
    }

    #[test]
    fn test_prom_response_parses_instant() {
        let json = r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1719830000,"0.75"]}]}}"#;
        let body: PromResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.data.result[0].instant_value(), Some(0.75));
    }

    #[test]
    fn test_prom_response_parses_range() {
        let json = r#"{"status":"success","data":{"resultType":"matrix","result":[{"metric":{},"values":[[1719830000,"1.0"],[1719830060,"2.5"]]}]}}"#;
        let body: PromResponse = serde_json::from_str(json).unwrap();
        let values = body.data.result[0].range_values();
        assert_eq!(values, vec![(1719830000, 1.0), (1719830060, 2.5)]);
    }
}
