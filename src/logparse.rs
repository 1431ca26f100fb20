use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::evidence::LogEntry;

/* ============================= PATTERN KINDS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ErrorPrefix,
    FatalPrefix,
    Exception,
    StackFrame,
    Oom,
    Connection,
    Timeout,
    HttpStatus5xx,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::ErrorPrefix => "error_prefix",
            PatternKind::FatalPrefix => "fatal_prefix",
            PatternKind::Exception => "exception",
            PatternKind::StackFrame => "stack_frame",
            PatternKind::Oom => "oom",
            PatternKind::Connection => "connection",
            PatternKind::Timeout => "timeout",
            PatternKind::HttpStatus5xx => "http_status_5xx",
        }
    }
}

/// One collapsed pattern occurrence. Identical representative lines within
/// a parse session are merged, keeping count and first/last timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPattern {
    pub pattern_kind: PatternKind,
    pub count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub representative_line: String,
}

/* ============================= NORMALIZATION ============================= */

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("regex is valid"));

// Leading RFC3339/ISO timestamps, optionally bracketed, with optional
// sub-second precision and zone suffix.
static LEADING_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\[?\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?\]?\s*"#,
    )
    .expect("regex is valid")
});

/// Strip ANSI escapes and a leading timestamp so the same logical line
/// always normalizes to the same string.
pub fn normalize_line(line: &str) -> String {
    let no_ansi = ANSI_ESCAPE.replace_all(line, "");
    let no_ts = LEADING_TIMESTAMP.replace(no_ansi.trim(), "");
    no_ts.trim().to_string()
}

/* ============================= CLASSIFIER ============================= */

static RE_FATAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\[?(fatal|panic)\b").expect("regex is valid"));

static RE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(^\[?(error|err)\b|level=error|"level":"error")"#).expect("regex is valid")
});

static RE_EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_.]*(Exception|Error)\b.*:|^Traceback \(most recent call last\))")
        .expect("regex is valid")
});

static RE_STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(at\s+\S+\(|File "[^"]+", line \d+|\s+at\s+\S+)"#).expect("regex is valid")
});

static RE_OOM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(out of memory|oom-?kill|oomkilled|cannot allocate memory)")
        .expect("regex is valid")
});

static RE_CONNECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(connection refused|connection reset|broken pipe|no route to host|econnrefused|econnreset)")
        .expect("regex is valid")
});

static RE_TIMEOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed out|timeout exceeded|deadline exceeded|etimedout)")
        .expect("regex is valid")
});

static RE_HTTP_5XX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(status(_code)?[=: ]"?5\d{2}\b|HTTP/[0-9.]+"? 5\d{2}\b|\b5\d{2} (internal server error|bad gateway|service unavailable|gateway timeout))"#)
        .expect("regex is valid")
});

/// Classify a normalized line. First match in the fixed kind order wins,
/// so classification is deterministic.
fn classify(line: &str) -> Option<PatternKind> {
    let order: [(PatternKind, &Regex); 8] = [
        (PatternKind::FatalPrefix, &RE_FATAL),
        (PatternKind::ErrorPrefix, &RE_ERROR),
        (PatternKind::Exception, &RE_EXCEPTION),
        (PatternKind::StackFrame, &RE_STACK_FRAME),
        (PatternKind::Oom, &RE_OOM),
        (PatternKind::Connection, &RE_CONNECTION),
        (PatternKind::Timeout, &RE_TIMEOUT),
        (PatternKind::HttpStatus5xx, &RE_HTTP_5XX),
    ];
    order
        .iter()
        .find(|(_, re)| re.is_match(line))
        .map(|(kind, _)| *kind)
}

/* ============================= PARSER ============================= */

const MAX_REPRESENTATIVE_LEN: usize = 300;

/// Extract failure patterns from raw log entries.
///
/// Single pass over the input; duplicate representative lines collapse
/// into one pattern with an occurrence count. Output order is the order
/// of first occurrence, which makes the result stable for a given input.
pub fn parse_entries(entries: &[LogEntry]) -> Vec<ParsedPattern> {
    let mut by_line: HashMap<String, usize> = HashMap::new();
    let mut patterns: Vec<ParsedPattern> = Vec::new();

    for entry in entries {
        let normalized = normalize_line(&entry.line);
        if normalized.is_empty() {
            continue;
        }
        let Some(kind) = classify(&normalized) else {
            continue;
        };

        let mut representative = normalized;
        if representative.len() > MAX_REPRESENTATIVE_LEN {
            let mut cut = MAX_REPRESENTATIVE_LEN;
            while !representative.is_char_boundary(cut) {
                cut -= 1;
            }
            representative.truncate(cut);
        }

        match by_line.get(&representative) {
            Some(&idx) => {
                let p = &mut patterns[idx];
                p.count += 1;
                if let Some(ts) = entry.timestamp {
                    if p.first_seen.map_or(true, |f| ts < f) {
                        p.first_seen = Some(ts);
                    }
                    if p.last_seen.map_or(true, |l| ts > l) {
                        p.last_seen = Some(ts);
                    }
                }
            }
            None => {
                by_line.insert(representative.clone(), patterns.len());
                patterns.push(ParsedPattern {
                    pattern_kind: kind,
                    count: 1,
                    first_seen: entry.timestamp,
                    last_seen: entry.timestamp,
                    representative_line: representative,
                });
            }
        }
    }

    patterns
}

/// Total occurrences of a given kind across parsed patterns.
pub fn count_kind(patterns: &[ParsedPattern], kind: PatternKind) -> u64 {
    patterns
        .iter()
        .filter(|p| p.pattern_kind == kind)
        .map(|p| p.count)
        .sum()
}

/* ============================= TESTS ============================= */
