use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use tokio::sync::broadcast;
use tracing::info;

use tarka::collectors::Providers;
use tarka::config::Config;
use tarka::index::Index;
use tarka::llm::LlmClient;
use tarka::queue::Queue;
use tarka::store::ArtifactStore;
use tarka::worker::{Worker, metrics_text};

pub async fn run(metrics_addr: &str) -> Result<i32> {
    println!("Starting worker...\n");
    info!("worker_starting");

    let config = Arc::new(Config::from_env()?);

    print!("  Queue connection ............ ");
    let queue = match Queue::connect(&config.queue).await {
        Ok(queue) => {
            println!("OK ({})", config.queue.nats_url);
            Arc::new(queue)
        }
        Err(e) => {
            println!("FAIL");
            eprintln!("Error: {e:#}");
            return Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE);
        }
    };
    queue.ensure_streams().await?;

    print!("  Artifact store .............. ");
    let store = match &config.s3_bucket {
        Some(_) => match ArtifactStore::connect(&config).await {
            Ok(store) => {
                println!("OK");
                Some(Arc::new(store))
            }
            Err(e) => {
                println!("FAIL");
                eprintln!("Error: {e:#}");
                return Ok(crate::cli::EXIT_PROVIDER_UNAVAILABLE);
            }
        },
        None => {
            println!("not configured (reports will not be persisted)");
            None
        }
    };

    print!("  Metadata index .............. ");
    let index = match &config.database_url {
        Some(url) => match Index::connect(url).await {
            Ok(index) => {
                index.ensure_schema().await?;
                println!("OK");
                Some(Arc::new(index))
            }
            Err(e) => {
                println!("degraded ({e:#})");
                None
            }
        },
        None => {
            println!("not configured");
            None
        }
    };

    print!("  Providers ................... ");
    let providers = Arc::new(Providers::from_config(&config).await);
    println!(
        "k8s={} metrics={} logs={} aws={} github={}",
        if providers.k8s.is_some() { "on" } else { "off" },
        if providers.metrics.is_some() { "on" } else { "off" },
        if providers.logs.is_some() { "on" } else { "off" },
        if providers.aws.is_some() { "on" } else { "off" },
        if providers.github.is_some() { "on" } else { "off" },
    );

    let llm = LlmClient::from_config(&config.llm).map(Arc::new);
    if llm.is_some() {
        println!("  LLM enrichment .............. enabled");
    }

    let addr: SocketAddr = metrics_addr.parse().context("Invalid metrics address")?;
    println!("  Health/metrics .............. http://{addr}");
    println!();
    println!(
        "Worker running ({} concurrent, batch {}). Press Ctrl+C to stop.\n",
        config.worker.concurrency, config.worker.fetch_batch
    );
    println!("{}", "=".repeat(70));

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let http = tokio::spawn(async move {
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/metrics", get(|| async { metrics_text() }));
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    });

    let worker = Arc::new(Worker {
        config: config.clone(),
        queue,
        providers,
        store,
        index,
        llm,
    });

    // The worker owns the ctrl-c handling; when it returns, the drain is
    // already complete.
    worker.run().await?;

    println!("\n{}", "=".repeat(70));
    println!("Worker stopped.");
    let _ = shutdown_tx.send(());
    let _ = http.await;

    info!("worker_stopped");
    Ok(crate::cli::EXIT_OK)
}
