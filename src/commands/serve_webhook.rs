use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use tarka::config::Config;
use tarka::index::Index;
use tarka::ingest::{IngestState, router};
use tarka::queue::Queue;

pub async fn run(addr_str: &str) -> Result<i32> {
    println!("Starting webhook receiver...\n");
    info!("webhook_starting");

    let config = Config::from_env()?;

    print!("  Queue connection ............ ");
    let queue = match Queue::connect(&config.queue).await {
        Ok(queue) => {
            println!("OK ({})", config.queue.nats_url);
            queue
        }
        Err(e) => {
            println!("FAIL");
            eprintln!("Error: {e:#}");
            return Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE);
        }
    };
    queue.ensure_streams().await?;

    print!("  Metadata index .............. ");
    let index = match &config.database_url {
        Some(url) => match Index::connect(url).await {
            Ok(index) => {
                index.ensure_schema().await?;
                println!("OK");
                Some(Arc::new(index))
            }
            Err(e) => {
                // Without the index the freshness gate degrades to
                // enqueue-always; ingestion itself keeps working.
                println!("degraded ({e:#})");
                None
            }
        },
        None => {
            println!("not configured");
            None
        }
    };

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /alerts .............. Alertmanager webhook (v4 payload)");
    println!("    GET  /healthz ............. Component health");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    if config.alertname_allowlist.is_empty() {
        println!("  Allowlist ................... disabled (all alertnames accepted)");
    } else {
        println!("  Allowlist ................... {} alertname(s)", config.alertname_allowlist.len());
    }
    println!();
    println!("Webhook receiver running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let state = IngestState {
        config: Arc::new(config),
        queue: Arc::new(queue),
        index,
    };

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping webhook receiver...");

    let _ = shutdown_tx.send(());
    server.await?.context("server error")?;

    info!("webhook_stopped");
    println!("Webhook receiver stopped.");
    Ok(crate::cli::EXIT_OK)
}
