use anyhow::Result;

use tarka::config::Config;
use tarka::model::Family;

use super::fetch_active_alerts;

pub async fn run() -> Result<i32> {
    let config = Config::from_env()?;
    let Some(alertmanager_url) = &config.alertmanager_url else {
        eprintln!("ALERTMANAGER_URL is not configured");
        return Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE);
    };

    let alerts = match fetch_active_alerts(alertmanager_url).await {
        Ok(alerts) => alerts,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE);
        }
    };

    if alerts.is_empty() {
        println!("No active alerts.");
        return Ok(crate::cli::EXIT_OK);
    }

    println!("{} active alert(s):\n", alerts.len());
    println!("{:>3}  {:<32} {:<24} {:<10} {}", "#", "ALERTNAME", "TARGET", "SEVERITY", "SINCE");
    for (i, alert) in alerts.iter().enumerate() {
        let instance = alert.to_alert_instance();
        let family = Family::infer(&instance);
        let target = match (instance.namespace(), instance.pod()) {
            (Some(ns), Some(pod)) => format!("{ns}/{pod}"),
            (Some(ns), None) => ns.to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{i:>3}  {:<32} {:<24} {:<10} {} [{}]",
            instance.alertname,
            target,
            instance.severity().unwrap_or("-"),
            instance.starts_at.format("%Y-%m-%d %H:%M:%SZ"),
            family.as_str(),
        );
    }
    println!("\nInvestigate one with: tarka investigate --alert <#>");

    Ok(crate::cli::EXIT_OK)
}
