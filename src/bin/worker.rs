use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dispatch_lite::config::WorkerNodeConfig;
use dispatch_lite::node::{run_worker_node, NodeState};
use dispatch_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "dispatch-worker")]
#[command(about = "Worker node process for the dispatch-lite orchestrator")]
struct Args {
    /// Worker name as registered with the orchestrator
    #[arg(long)]
    name: String,

    /// Address to bind the worker HTTP server on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port for the worker HTTP server
    #[arg(long, default_value = "8500")]
    port: u16,

    /// Base URL of the orchestrator
    #[arg(long)]
    orchestrator_url: String,

    /// Maximum concurrent jobs
    #[arg(long, default_value = "10")]
    max_jobs: u32,

    /// Shared callback token expected by the orchestrator
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let listen_addr: SocketAddr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "Bad listen address");
            std::process::exit(1);
        }
    };

    let config = WorkerNodeConfig {
        name: args.name,
        listen_addr,
        orchestrator_url: args.orchestrator_url,
        max_jobs: args.max_jobs,
        callback_token: args.token,
    };

    tracing::info!(
        worker = %config.name,
        addr = %config.listen_addr,
        orchestrator = %config.orchestrator_url,
        max_jobs = config.max_jobs,
        "Starting dispatch-worker"
    );

    let shutdown = install_shutdown_handler();
    let state = Arc::new(NodeState::new(config.clone(), shutdown.clone()));

    // On shutdown, in-flight jobs are cancelled so the orchestrator gets
    // their terminal events before the server closes.
    let drain_state = state.clone();
    let drain_token = shutdown.clone();
    tokio::spawn(async move {
        drain_token.cancelled().await;
        drain_state.cancel_all();
    });

    if let Err(e) = run_worker_node(config, state).await {
        tracing::error!(error = %e, "Worker node failed");
        std::process::exit(1);
    }
}
