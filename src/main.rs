use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dispatch_lite::api::auth::hash_password;
use dispatch_lite::config::{DbConfig, DbKind, OrchestratorConfig};
use dispatch_lite::error::DispatchError;
use dispatch_lite::model::User;
use dispatch_lite::orchestrator::Orchestrator;
use dispatch_lite::repo::{MemoryRepository, Repository, SqlRepository};
use dispatch_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(about = "A distributed job dispatcher with queues, workers, and live log streaming")]
struct Args {
    /// Port the API server listens on
    #[arg(long, default_value = "8420")]
    port: u16,

    /// Base URL workers use to reach this orchestrator
    #[arg(long)]
    public_url: Option<String>,

    /// Root directory for log artifacts
    #[arg(long, default_value = "logs")]
    log_root: PathBuf,

    /// Storage backend: "memory", "sqlite", or "postgresql"
    #[arg(long, default_value = "sqlite")]
    db_type: String,

    /// SQLite database file (db-type sqlite)
    #[arg(long, default_value = "dispatch.db")]
    sqlite_path: PathBuf,

    /// PostgreSQL connection pieces (db-type postgresql)
    #[arg(long, default_value = "localhost")]
    pg_host: String,
    #[arg(long, default_value = "5432")]
    pg_port: u16,
    #[arg(long, default_value = "dispatch")]
    pg_db: String,
    #[arg(long, default_value = "")]
    pg_user: String,
    #[arg(long, default_value = "")]
    pg_pwd: String,

    /// Worker health monitor period in seconds (5-300)
    #[arg(long, default_value = "30")]
    monitor_interval: u64,

    /// Delete terminal jobs older than this many days (0 disables)
    #[arg(long, default_value = "0")]
    retention_days: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "Orchestrator failed to start");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> dispatch_lite::Result<()> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port)
        .parse()
        .map_err(|e| DispatchError::Fatal(format!("bad listen address: {e}")))?;
    let public_url = args
        .public_url
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", args.port));

    let db = DbConfig {
        db_type: match args.db_type.as_str() {
            "memory" | "sqlite" => DbKind::Sqlite,
            other => other.parse()?,
        },
        sqlite_path: args.sqlite_path,
        pg_host: args.pg_host,
        pg_port: args.pg_port,
        pg_db: args.pg_db,
        pg_user: args.pg_user,
        pg_pwd: args.pg_pwd,
        ..DbConfig::default()
    };

    let repo: Arc<dyn Repository> = if args.db_type == "memory" {
        Arc::new(MemoryRepository::new())
    } else {
        Arc::new(SqlRepository::connect(&db).await?)
    };

    let config = OrchestratorConfig {
        listen_addr,
        public_url,
        log_root: args.log_root,
        db,
        monitor_interval_secs: args.monitor_interval,
        retention_days: args.retention_days,
        callback_token: Some(Uuid::new_v4().simple().to_string()),
    };

    bootstrap_admin(repo.as_ref()).await?;

    tracing::info!(
        addr = %config.listen_addr,
        public_url = %config.public_url,
        db = %config.db.db_type,
        "Starting dispatch-lite orchestrator"
    );

    let orchestrator = Orchestrator::new(config, repo)?;
    let cancel = install_shutdown_handler();
    orchestrator.run(cancel).await
}

/// First run only: create the admin account with a generated password and
/// print it once.
async fn bootstrap_admin(repo: &dyn Repository) -> dispatch_lite::Result<()> {
    if repo.count_users().await? > 0 {
        return Ok(());
    }
    let password = Uuid::new_v4().simple().to_string();
    repo.create_user(User {
        id: 0,
        username: "admin".to_string(),
        password_hash: hash_password(&password),
        full_name: Some("Administrator".to_string()),
        role: "admin".to_string(),
        auth_source: "local".to_string(),
        is_active: true,
        last_login: None,
        created_at: Utc::now(),
    })
    .await?;
    tracing::warn!(username = "admin", password = %password, "Created initial admin user");
    Ok(())
}
