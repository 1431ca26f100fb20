use anyhow::Result;

use tarka::config::Config;
use tarka::index::Index;
use tarka::providers::k8s::K8sProvider;
use tarka::queue::Queue;

/// Probe every configured provider: one status line each, exit 3 when
/// anything configured is down.
pub async fn run() -> Result<i32> {
    let config = Config::from_env()?;
    println!("Checking provider connectivity...\n");

    let mut failures = 0u32;

    print!("  Kubernetes .................. ");
    match K8sProvider::connect().await {
        Ok(k8s) => match k8s.apiserver_version().await {
            Ok(version) => println!("OK ({version})"),
            Err(e) => {
                println!("FAIL ({e:#})");
                failures += 1;
            }
        },
        Err(e) => {
            println!("FAIL ({e:#})");
            failures += 1;
        }
    }

    print!("  Prometheus .................. ");
    match &config.prometheus_url {
        Some(url) => match probe_http(&format!("{}/-/ready", url.trim_end_matches('/'))).await {
            Ok(()) => println!("OK ({url})"),
            Err(e) => {
                println!("FAIL ({e})");
                failures += 1;
            }
        },
        None => println!("not configured"),
    }

    print!("  Logs backend ................ ");
    match &config.logs_url {
        Some(url) => match probe_http(url).await {
            Ok(()) => println!("OK ({url})"),
            Err(e) => {
                println!("FAIL ({e})");
                failures += 1;
            }
        },
        None => println!("not configured"),
    }

    print!("  NATS / JetStream ............ ");
    match Queue::connect(&config.queue).await {
        Ok(_) => println!("OK ({})", config.queue.nats_url),
        Err(e) => {
            println!("FAIL ({e:#})");
            failures += 1;
        }
    }

    print!("  Metadata index .............. ");
    match &config.database_url {
        Some(url) => match Index::connect(url).await {
            Ok(index) => match index.ping().await {
                Ok(()) => println!("OK"),
                Err(e) => {
                    println!("FAIL ({e:#})");
                    failures += 1;
                }
            },
            Err(e) => {
                println!("FAIL ({e:#})");
                failures += 1;
            }
        },
        None => println!("not configured"),
    }

    print!("  Alertmanager ................ ");
    match &config.alertmanager_url {
        Some(url) => match probe_http(&format!("{}/-/ready", url.trim_end_matches('/'))).await {
            Ok(()) => println!("OK ({url})"),
            Err(e) => {
                println!("FAIL ({e})");
                failures += 1;
            }
        },
        None => println!("not configured"),
    }

    println!();
    if failures == 0 {
        println!("All configured providers reachable.");
        Ok(crate::cli::EXIT_OK)
    } else {
        println!("{failures} provider(s) unreachable.");
        Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE)
    }
}

async fn probe_http(url: &str) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .get(url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("http {}", resp.status().as_u16()))
    }
}
