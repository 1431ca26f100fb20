use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use tarka::collectors::Providers;
use tarka::config::{Config, parse_time_window};
use tarka::index::Index;
use tarka::llm::LlmClient;
use tarka::model::{
    AlertStatus, Family, Identity, InvestigationJob, TimeWindow, case_id, dedup_bucket,
};
use tarka::pipeline::Pipeline;

use super::fetch_active_alerts;

/// Run a single investigation interactively, bypassing the queue, and
/// print the report to stdout.
pub async fn run(
    alert_index: Option<usize>,
    fingerprint: Option<String>,
    time_window: Option<String>,
    llm: bool,
    dump_json: Option<PathBuf>,
) -> Result<i32> {
    let mut config = Config::from_env()?;
    if llm {
        config.llm.enabled = true;
    }

    let window = match &time_window {
        Some(raw) => config.clamp_window(parse_time_window(raw)?),
        None => config.time_window,
    };

    let Some(alertmanager_url) = config.alertmanager_url.clone() else {
        eprintln!("ALERTMANAGER_URL is not configured");
        return Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE);
    };

    if alert_index.is_none() && fingerprint.is_none() {
        eprintln!("one of --alert or --fingerprint is required");
        return Ok(crate::cli::EXIT_USAGE);
    }

    let alerts = match fetch_active_alerts(&alertmanager_url).await {
        Ok(alerts) => alerts,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE);
        }
    };

    let selected = match (&alert_index, &fingerprint) {
        (Some(i), _) => alerts.get(*i),
        (None, Some(fp)) => alerts.iter().find(|a| &a.fingerprint == fp),
        (None, None) => unreachable!("validated above"),
    };
    let Some(selected) = selected else {
        eprintln!("no matching active alert (run `tarka list-alerts` to see what is firing)");
        return Ok(crate::cli::EXIT_USAGE);
    };

    let alert = selected.to_alert_instance();
    if alert.status == AlertStatus::Resolved {
        eprintln!("alert {} is already resolved", alert.alertname);
        return Ok(crate::cli::EXIT_USAGE);
    }

    let identity = Identity::from_alert(&alert, &config.cluster_name);
    let family = Family::infer(&alert);
    let job = InvestigationJob {
        identity: identity.clone(),
        family,
        window: TimeWindow::ending_at(alert.starts_at, window),
        alert,
        dedup_bucket: dedup_bucket(Utc::now()),
        overwrite: false,
    };

    println!("Investigating {} ({})...\n", job.alert.alertname, identity.canonical());

    let providers = Providers::from_config(&config).await;
    let llm_client = LlmClient::from_config(&config.llm).map(Arc::new);

    let recurrence = match &config.database_url {
        Some(url) => match Index::connect(url).await {
            Ok(index) => index
                .recurrence_24h(&case_id(&identity, family))
                .await
                .unwrap_or(0),
            Err(_) => 0,
        },
        None => 0,
    };

    let pipeline = Pipeline {
        config: &config,
        providers: &providers,
        llm: llm_client.as_deref(),
    };
    let investigation = pipeline.investigate(&job, recurrence).await;

    println!("{}", investigation.report_markdown);

    if let Some(path) = dump_json {
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(&investigation.report_json).context("serialize report")?,
        )
        .with_context(|| format!("write {}", path.display()))?;
        eprintln!("Structured report written to {}", path.display());
    }

    Ok(crate::cli::EXIT_OK)
}
