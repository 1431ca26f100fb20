use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tarka")]
#[command(about = "Alert triage for Kubernetes/Prometheus: deterministic, evidence-backed reports")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Probe every configured provider and report availability
    Check,

    /// List currently firing alerts from Alertmanager
    ListAlerts,

    /// Run one investigation interactively and print the report
    Investigate {
        /// Index into `list-alerts` output
        #[arg(long, conflicts_with = "fingerprint")]
        alert: Option<usize>,

        /// Alertmanager fingerprint of the alert to investigate
        #[arg(long)]
        fingerprint: Option<String>,

        /// Evidence window, e.g. 30m, 1h, 2h30m (clamped to the configured max)
        #[arg(long)]
        time_window: Option<String>,

        /// Run the optional LLM enrichment for this investigation
        #[arg(long)]
        llm: bool,

        /// Write the structured report JSON to this path
        #[arg(long)]
        dump_json: Option<std::path::PathBuf>,
    },

    /// Start the Alertmanager webhook receiver
    ServeWebhook {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },

    /// Start the durable queue worker
    RunWorker {
        /// Address for the worker's health/metrics endpoints
        #[arg(long, default_value = "0.0.0.0:9090")]
        metrics_addr: String,
    },
}

/* ============================= EXIT CODES ============================= */

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_PROVIDER_UNAVAILABLE: i32 = 3;
pub const EXIT_PIPELINE_FATAL: i32 = 4;
