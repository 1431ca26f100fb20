use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/* ============================= DEFAULTS ============================= */

const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(3600);
const DEFAULT_TIME_WINDOW_MAX: Duration = Duration::from_secs(6 * 3600);
const DEFAULT_PIPELINE_BUDGET: Duration = Duration::from_secs(120);
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(300);
const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);
const DEFAULT_CLOUDTRAIL_LOOKBACK_MINUTES: u64 = 60;
const DEFAULT_CLOUDTRAIL_MAX_EVENTS: usize = 50;

/* ============================= TYPES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogsBackend {
    Auto,
    Loki,
    VictoriaLogs,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub nats_url: String,
    pub stream: String,
    pub subject: String,
    pub durable: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub backoff: Vec<Duration>,
    pub dlq_stream: String,
    pub dlq_subject: String,
    pub completions_subject: String,
    pub duplicate_window: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub fetch_batch: usize,
}

#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub enabled: bool,
    pub cloudtrail_lookback: Duration,
    pub cloudtrail_max_events: usize,
}

#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub enabled: bool,
    pub token: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub include_logs: bool,
    pub redact_infrastructure: bool,
}

/// Process-wide configuration, constructed once from the environment and
/// threaded through every component explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster_name: String,
    pub prometheus_url: Option<String>,
    pub alertmanager_url: Option<String>,
    pub logs_url: Option<String>,
    pub logs_backend: LogsBackend,
    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
    pub s3_endpoint_url: Option<String>,
    pub database_url: Option<String>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub time_window: Duration,
    pub time_window_max: Duration,
    pub pipeline_budget: Duration,
    pub alertname_allowlist: Vec<String>,
    pub rollout_noisy_extra: Vec<String>,
    pub aws: AwsConfig,
    pub github: GithubConfig,
    pub llm: LlmConfig,
}

/* ============================= LOADING ============================= */

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env_opt(key) {
        Some(v) => v
            .parse::<u64>()
            .with_context(|| format!("{key} must be a non-negative integer, got {v:?}")),
        None => Ok(default),
    }
}

fn env_csv(key: &str) -> Vec<String> {
    env_opt(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let backoff = env_opt("JETSTREAM_BACKOFF_SECONDS")
            .unwrap_or_else(|| "5,30,120".to_string())
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("JETSTREAM_BACKOFF_SECONDS entry {s:?} is not an integer"))
            })
            .collect::<Result<Vec<_>>>()?;

        let stream = env_or("JETSTREAM_STREAM", "TARKA");
        let queue = QueueConfig {
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            subject: env_or("JETSTREAM_SUBJECT", &format!("{}.alerts", stream.to_lowercase())),
            durable: env_or("JETSTREAM_DURABLE", "tarka-worker"),
            ack_wait: Duration::from_secs(env_u64(
                "JETSTREAM_ACK_WAIT_SECONDS",
                DEFAULT_ACK_WAIT.as_secs(),
            )?),
            max_deliver: env_u64("JETSTREAM_MAX_DELIVER", 4)? as i64,
            backoff,
            dlq_stream: env_or("JETSTREAM_DLQ_STREAM", &format!("{stream}_DLQ")),
            dlq_subject: env_or(
                "JETSTREAM_DLQ_SUBJECT",
                &format!("{}.dlq", stream.to_lowercase()),
            ),
            completions_subject: env_or(
                "JETSTREAM_COMPLETIONS_SUBJECT",
                &format!("{}.completions", stream.to_lowercase()),
            ),
            duplicate_window: Duration::from_secs(env_u64(
                "JETSTREAM_DUPLICATE_WINDOW_SECONDS",
                DEFAULT_DUPLICATE_WINDOW.as_secs(),
            )?),
            stream,
        };

        let worker = WorkerConfig {
            concurrency: env_u64("WORKER_CONCURRENCY", 4)? as usize,
            fetch_batch: env_u64("WORKER_FETCH_BATCH", 8)? as usize,
        };

        let time_window_max = match env_opt("TIME_WINDOW_MAX") {
            Some(v) => parse_time_window(&v).context("TIME_WINDOW_MAX")?,
            None => DEFAULT_TIME_WINDOW_MAX,
        };
        let time_window = match env_opt("TIME_WINDOW") {
            Some(v) => parse_time_window(&v)
                .context("TIME_WINDOW")?
                .min(time_window_max),
            None => DEFAULT_TIME_WINDOW,
        };

        let cloudtrail_lookback_minutes = match env_opt("AWS_CLOUDTRAIL_LOOKBACK_MINUTES") {
            Some(v) => v
                .parse::<u64>()
                .context("AWS_CLOUDTRAIL_LOOKBACK_MINUTES must be an integer")?,
            // Legacy double-prefixed spelling, still honored.
            None => match env_opt("AWS_AWS_CLOUDTRAIL_LOOKBACK_MINUTES") {
                Some(v) => {
                    warn!("deprecated_env_var AWS_AWS_CLOUDTRAIL_LOOKBACK_MINUTES, use AWS_CLOUDTRAIL_LOOKBACK_MINUTES");
                    v.parse::<u64>()
                        .context("AWS_AWS_CLOUDTRAIL_LOOKBACK_MINUTES must be an integer")?
                }
                None => DEFAULT_CLOUDTRAIL_LOOKBACK_MINUTES,
            },
        };

        let logs_backend = match env_or("LOGS_BACKEND", "auto").to_lowercase().as_str() {
            "auto" => LogsBackend::Auto,
            "loki" => LogsBackend::Loki,
            "victorialogs" => LogsBackend::VictoriaLogs,
            other => anyhow::bail!("LOGS_BACKEND must be auto|loki|victorialogs, got {other:?}"),
        };

        Ok(Config {
            cluster_name: env_or("CLUSTER_NAME", "default"),
            prometheus_url: env_opt("PROMETHEUS_URL"),
            alertmanager_url: env_opt("ALERTMANAGER_URL"),
            logs_url: env_opt("LOGS_URL"),
            logs_backend,
            s3_bucket: env_opt("S3_BUCKET"),
            s3_prefix: env_or("S3_PREFIX", "tarka"),
            s3_endpoint_url: env_opt("S3_ENDPOINT_URL"),
            database_url: env_opt("DATABASE_URL"),
            queue,
            worker,
            time_window,
            time_window_max,
            pipeline_budget: Duration::from_secs(env_u64(
                "PIPELINE_BUDGET_SECONDS",
                DEFAULT_PIPELINE_BUDGET.as_secs(),
            )?),
            alertname_allowlist: env_csv("ALERTNAME_ALLOWLIST"),
            rollout_noisy_extra: env_csv("ROLLOUT_NOISY_ALERTNAMES"),
            aws: AwsConfig {
                enabled: env_bool("AWS_EVIDENCE_ENABLED", false),
                cloudtrail_lookback: Duration::from_secs(cloudtrail_lookback_minutes * 60),
                cloudtrail_max_events: env_u64(
                    "AWS_CLOUDTRAIL_MAX_EVENTS",
                    DEFAULT_CLOUDTRAIL_MAX_EVENTS as u64,
                )? as usize,
            },
            github: GithubConfig {
                enabled: env_bool("GITHUB_EVIDENCE_ENABLED", false),
                token: env_opt("GITHUB_TOKEN"),
                repo: env_opt("GITHUB_REPO"),
            },
            llm: LlmConfig {
                enabled: env_bool("LLM_ENABLED", false),
                url: env_opt("LLM_URL"),
                model: env_or("LLM_MODEL", "gpt-4o-mini"),
                api_key: env_opt("LLM_API_KEY"),
                include_logs: env_bool("LLM_INCLUDE_LOGS", false),
                redact_infrastructure: env_bool("LLM_REDACT_INFRASTRUCTURE", true),
            },
        })
    }

    /// Clamp a user-supplied window to the configured maximum.
    pub fn clamp_window(&self, window: Duration) -> Duration {
        window.min(self.time_window_max)
    }
}

/* ============================= TIME WINDOW PARSER ============================= */

/// Parse a compact duration like `30m`, `1h`, or `2h30m`.
///
/// Accepted units are `h`, `m`, and `s`; components must appear in
/// descending unit order and at most once. Zero-length windows are rejected.
pub fn parse_time_window(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        anyhow::bail!("time window is empty");
    }
    if s.starts_with('-') {
        anyhow::bail!("time window must be positive, got {s:?}");
    }

    let mut total: u64 = 0;
    let mut number = String::new();
    let mut last_unit_rank = 0u8;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        if number.is_empty() {
            anyhow::bail!("time window {s:?}: unit {ch:?} without a number");
        }
        let value: u64 = number
            .parse()
            .with_context(|| format!("time window {s:?}: bad number {number:?}"))?;
        number.clear();

        let (rank, seconds) = match ch {
            'h' => (1, 3600),
            'm' => (2, 60),
            's' => (3, 1),
            other => anyhow::bail!("time window {s:?}: unknown unit {other:?}"),
        };
        if rank <= last_unit_rank {
            anyhow::bail!("time window {s:?}: units must be in h, m, s order without repeats");
        }
        last_unit_rank = rank;
        total += value * seconds;
    }

    if !number.is_empty() {
        anyhow::bail!("time window {s:?}: trailing number without a unit");
    }
    if total == 0 {
        anyhow::bail!("time window must be greater than zero, got {s:?}");
    }

    Ok(Duration::from_secs(total))
}

/// Format a duration back into the compact form accepted by
/// [`parse_time_window`].
pub fn format_time_window(d: Duration) -> String {
    let mut secs = d.as_secs();
    let mut out = String::new();
    if secs >= 3600 {
        out.push_str(&format!("{}h", secs / 3600));
        secs %= 3600;
    }
    if secs >= 60 {
        out.push_str(&format!("{}m", secs / 60));
        secs %= 60;
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_windows() {
        assert_eq!(parse_time_window("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_time_window("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_time_window("45s").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_compound_window() {
        assert_eq!(
            parse_time_window("2h30m").unwrap(),
            Duration::from_secs(2 * 3600 + 1800)
        );
        assert_eq!(
            parse_time_window("1h30m15s").unwrap(),
            Duration::from_secs(3600 + 1800 + 15)
        );
    }

    #[test]
    fn test_parse_rejects_zero_and_negative() {
        assert!(parse_time_window("0m").is_err());
        assert!(parse_time_window("0h0m").is_err());
        assert!(parse_time_window("-1h").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_time_window("").is_err());
        assert!(parse_time_window("h").is_err());
        assert!(parse_time_window("90").is_err());
        assert!(parse_time_window("1x").is_err());
        assert!(parse_time_window("30m1h").is_err(), "units out of order");
        assert!(parse_time_window("1h1h").is_err(), "repeated unit");
    }

    #[test]
    fn test_format_round_trip() {
        for input in ["30m", "1h", "2h30m", "45s", "1h30m15s"] {
            let parsed = parse_time_window(input).unwrap();
            assert_eq!(format_time_window(parsed), input);
        }
    }
}
