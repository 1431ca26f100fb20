use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{Slot, classify_reqwest, classify_status};
use crate::config::LogsBackend;
use crate::evidence::LogEntry;

/* ============================= BACKEND DETECTION ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Loki,
    VictoriaLogs,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Loki => "loki",
            Backend::VictoriaLogs => "victorialogs",
        }
    }
}

/// Pick the backend from the URL unless the configuration pins one.
/// Unrecognized URLs default to Loki, the more common deployment.
pub fn detect_backend(url: &str, configured: LogsBackend) -> Backend {
    match configured {
        LogsBackend::Loki => Backend::Loki,
        LogsBackend::VictoriaLogs => Backend::VictoriaLogs,
        LogsBackend::Auto => {
            let lower = url.to_lowercase();
            if lower.contains("victoria") || lower.contains("vlogs") || lower.contains(":9428") {
                Backend::VictoriaLogs
            } else {
                Backend::Loki
            }
        }
    }
}

/* ============================= RESULT ============================= */

/// Raw tail result before pattern extraction.
#[derive(Debug, Clone)]
pub struct LogsFetch {
    pub backend: Backend,
    pub query: String,
    pub entries: Vec<LogEntry>,
}

/* ============================= PROVIDER ============================= */

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

pub struct LogsProvider {
    http: reqwest::Client,
    base_url: String,
    backend: Backend,
}

impl LogsProvider {
    pub fn new(base_url: &str, configured: LogsBackend) -> LogsProvider {
        let base_url = base_url.trim_end_matches('/').to_string();
        LogsProvider {
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            backend: detect_backend(&base_url, configured),
            base_url,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Tail logs for a live pod over `[start, end]`.
    pub async fn tail(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Slot<LogsFetch> {
        let query = match self.backend {
            Backend::Loki => loki_selector(namespace, pod, container),
            Backend::VictoriaLogs => logsql_selector(namespace, pod, container),
        };
        self.run_query(&query, start, end, limit).await
    }

    /// Historical fallback for TTL-deleted pods: match by pod-name prefix
    /// across the backend's retention instead of an exact pod label.
    pub async fn tail_by_prefix(
        &self,
        namespace: &str,
        pod_prefix: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Slot<LogsFetch> {
        let query = match self.backend {
            Backend::Loki => {
                format!("{{namespace=\"{namespace}\",pod=~\"{pod_prefix}.*\"}}")
            }
            Backend::VictoriaLogs => {
                format!("namespace:\"{namespace}\" AND pod:~\"{pod_prefix}.*\"")
            }
        };
        self.run_query(&query, start, end, limit).await
    }

    async fn run_query(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Slot<LogsFetch> {
        let result = match self.backend {
            Backend::Loki => self.query_loki(query, start, end, limit).await,
            Backend::VictoriaLogs => self.query_victoria(query, start, end, limit).await,
        };
        match result {
            Ok(mut entries) => {
                entries.sort_by_key(|e| e.timestamp);
                entries.truncate(limit);
                if entries.is_empty() {
                    // The backend answered; there were simply no lines.
                    Slot {
                        status: crate::evidence::SlotStatus::Empty,
                        data: Some(LogsFetch {
                            backend: self.backend,
                            query: query.to_string(),
                            entries: Vec::new(),
                        }),
                    }
                } else {
                    Slot::ok(LogsFetch {
                        backend: self.backend,
                        query: query.to_string(),
                        entries,
                    })
                }
            }
            Err(reason) => Slot::unavailable(reason),
        }
    }

    /// Loki `query_range`: nanosecond timestamps, LogQL stream selector.
    async fn query_loki(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, String> {
        let url = format!("{}/loki/api/v1/query_range", self.base_url);
        let start_ns = start.timestamp_nanos_opt().unwrap_or(0).to_string();
        let end_ns = end.timestamp_nanos_opt().unwrap_or(0).to_string();
        let limit_s = limit.to_string();

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("query", query),
                ("start", start_ns.as_str()),
                ("end", end_ns.as_str()),
                ("limit", limit_s.as_str()),
                ("direction", "backward"),
            ])
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;

        if !resp.status().is_success() {
            return Err(classify_status(resp.status().as_u16()));
        }

        let body: LokiResponse = resp.json().await.map_err(|e| classify_reqwest(&e))?;
        let entries = body
            .data
            .result
            .into_iter()
            .flat_map(|stream| stream.values)
            .filter_map(|(ts_ns, line)| {
                let nanos: i64 = ts_ns.parse().ok()?;
                Some(LogEntry {
                    timestamp: DateTime::from_timestamp(
                        nanos / 1_000_000_000,
                        (nanos % 1_000_000_000) as u32,
                    ),
                    line,
                })
            })
            .collect();
        Ok(entries)
    }

    /// VictoriaLogs LogsQL query endpoint: RFC3339 `_time` filter,
    /// newline-delimited JSON response.
    async fn query_victoria(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, String> {
        let url = format!("{}/select/logsql/query", self.base_url);
        let full_query = format!(
            "{query} AND _time:[{}, {}]",
            start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        let limit_s = limit.to_string();

        let resp = self
            .http
            .get(&url)
            .query(&[("query", full_query.as_str()), ("limit", limit_s.as_str())])
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;

        if !resp.status().is_success() {
            return Err(classify_status(resp.status().as_u16()));
        }

        let text = resp.text().await.map_err(|e| classify_reqwest(&e))?;
        Ok(parse_victoria_lines(&text))
    }
}

/* ============================= QUERY BUILDERS ============================= */

fn loki_selector(namespace: &str, pod: &str, container: Option<&str>) -> String {
    match container {
        Some(c) => format!("{{namespace=\"{namespace}\",pod=\"{pod}\",container=\"{c}\"}}"),
        None => format!("{{namespace=\"{namespace}\",pod=\"{pod}\"}}"),
    }
}

fn logsql_selector(namespace: &str, pod: &str, container: Option<&str>) -> String {
    match container {
        Some(c) => format!("namespace:\"{namespace}\" AND pod:\"{pod}\" AND container:\"{c}\""),
        None => format!("namespace:\"{namespace}\" AND pod:\"{pod}\""),
    }
}

/* ============================= WIRE TYPES ============================= */

#[derive(Debug, Deserialize)]
struct LokiResponse {
    #[serde(default)]
    data: LokiData,
}

#[derive(Debug, Default, Deserialize)]
struct LokiData {
    #[serde(default)]
    result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    #[serde(default)]
    values: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct VictoriaLine {
    #[serde(rename = "_time")]
    time: Option<String>,
    #[serde(rename = "_msg")]
    msg: Option<String>,
}

fn parse_victoria_lines(body: &str) -> Vec<LogEntry> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<VictoriaLine>(l).ok())
        .map(|v| LogEntry {
            timestamp: v
                .time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            line: v.msg.unwrap_or_default(),
        })
        .collect()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_backend_auto() {
        assert_eq!(
            detect_backend("http://loki.monitoring:3100", LogsBackend::Auto),
            Backend::Loki
        );
        assert_eq!(
            detect_backend("http://victorialogs.monitoring:9428", LogsBackend::Auto),
            Backend::VictoriaLogs
        );
        assert_eq!(
            detect_backend("http://vlogs.internal", LogsBackend::Auto),
            Backend::VictoriaLogs
        );
        assert_eq!(
            detect_backend("http://logs.internal:3100", LogsBackend::Auto),
            Backend::Loki,
            "unrecognized URL defaults to loki"
        );
    }

    #[test]
    fn test_detect_backend_override_wins() {
        assert_eq!(
            detect_backend("http://loki.monitoring:3100", LogsBackend::VictoriaLogs),
            Backend::VictoriaLogs
        );
    }

    #[test]
    fn test_loki_selector_shapes() {
        assert_eq!(
            loki_selector("prod", "web-abc", None),
            "{namespace=\"prod\",pod=\"web-abc\"}"
        );
        assert_eq!(
            loki_selector("prod", "web-abc", Some("app")),
            "{namespace=\"prod\",pod=\"web-abc\",container=\"app\"}"
        );
    }

    #[test]
    fn test_logsql_selector_shapes() {
        assert_eq!(
            logsql_selector("prod", "web-abc", None),
            "namespace:\"prod\" AND pod:\"web-abc\""
        );
    }

    #[test]
    fn test_parse_victoria_lines() {
        let body = r#"{"_time":"2026-07-01T12:00:00Z","_msg":"ERROR: boom"}
{"_time":"2026-07-01T12:00:01Z","_msg":"ok"}
"#;
        let entries = parse_victoria_lines(body);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].line, "ERROR: boom");
        assert!(entries[0].timestamp.is_some());
    }

    #[test]
    fn test_parse_victoria_skips_garbage() {
        let entries = parse_victoria_lines("not json\n{\"_msg\":\"fine\"}\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].line, "fine");
        assert!(entries[0].timestamp.is_none());
    }
}
