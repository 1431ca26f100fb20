//! Read-only provider adapters.
//!
//! Every adapter call returns a [`Slot`]: data plus an explicit
//! availability status. Expected external failures (timeouts, 4xx/5xx,
//! throttling) are classified into reason strings and never surface as
//! `Err`; an adapter that cannot answer says so in-band.

pub mod aws;
pub mod github;
pub mod k8s;
pub mod logs;
pub mod prometheus;

pub use crate::evidence::{Slot, SlotStatus};

/* ============================= REASONS ============================= */

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_FORBIDDEN: &str = "forbidden";
pub const REASON_NOT_FOUND: &str = "not_found";
pub const REASON_THROTTLED: &str = "throttled";
pub const REASON_CONNECT: &str = "connect_error";
pub const REASON_NOT_CONFIGURED: &str = "not_configured";

pub fn reason_http(code: u16) -> String {
    format!("http_error:{code}")
}

/// Map an HTTP response status to a reason string, preferring the specific
/// taxonomy entries over the generic `http_error:<code>` form.
pub fn classify_status(code: u16) -> String {
    match code {
        401 | 403 => REASON_FORBIDDEN.to_string(),
        404 => REASON_NOT_FOUND.to_string(),
        429 => REASON_THROTTLED.to_string(),
        other => reason_http(other),
    }
}

/// Classify a transport-level reqwest error.
pub fn classify_reqwest(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        REASON_TIMEOUT.to_string()
    } else if err.is_connect() {
        REASON_CONNECT.to_string()
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16())
    } else {
        "http_error:request".to_string()
    }
}

/* ============================= TESTS ============================= */
