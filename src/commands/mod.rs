pub mod check;
pub mod investigate;
pub mod list_alerts;
pub mod run_worker;
pub mod serve_webhook;
pub mod version;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use tarka::model::{AlertInstance, AlertStatus};

/* ============================= ALERTMANAGER CLIENT ============================= */

/// Alertmanager v2 API alert, as served by `GET /api/v2/alerts`.
#[derive(Debug, Deserialize)]
pub struct AmApiAlert {
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(default, rename = "endsAt")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub status: AmApiStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct AmApiStatus {
    #[serde(default)]
    pub state: String,
}

impl AmApiAlert {
    pub fn alertname(&self) -> &str {
        self.labels.get("alertname").map(String::as_str).unwrap_or("<unnamed>")
    }

    pub fn to_alert_instance(&self) -> AlertInstance {
        AlertInstance {
            fingerprint: self.fingerprint.clone(),
            alertname: self.alertname().to_string(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            starts_at: self.starts_at,
            ends_at: self.ends_at.filter(|t| t.timestamp() > 0),
            status: if self.status.state == "resolved" {
                AlertStatus::Resolved
            } else {
                AlertStatus::Firing
            },
        }
    }
}

/// Fetch active alerts from the Alertmanager API, newest first.
pub async fn fetch_active_alerts(alertmanager_url: &str) -> Result<Vec<AmApiAlert>> {
    let url = format!("{}/api/v2/alerts?active=true", alertmanager_url.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("Cannot reach Alertmanager at {alertmanager_url}"))?;

    if !resp.status().is_success() {
        anyhow::bail!("Alertmanager answered {}", resp.status());
    }

    let mut alerts: Vec<AmApiAlert> =
        resp.json().await.context("Alertmanager returned malformed JSON")?;
    alerts.sort_by_key(|a| std::cmp::Reverse(a.starts_at));
    Ok(alerts)
}
