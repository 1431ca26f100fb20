mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check => commands::check::run().await,
        Commands::ListAlerts => commands::list_alerts::run().await,
        Commands::Investigate { alert, fingerprint, time_window, llm, dump_json } => {
            commands::investigate::run(alert, fingerprint, time_window, llm, dump_json).await
        }
        Commands::ServeWebhook { addr } => commands::serve_webhook::run(&addr).await,
        Commands::RunWorker { metrics_addr } => commands::run_worker::run(&metrics_addr).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            cli::EXIT_PIPELINE_FATAL
        }
    };
    std::process::exit(code);
}
