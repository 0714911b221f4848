use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Bounds for the worker health monitor period, in seconds.
pub const MONITOR_INTERVAL_MIN_SECS: u64 = 5;
pub const MONITOR_INTERVAL_MAX_SECS: u64 = 300;
pub const MONITOR_INTERVAL_DEFAULT_SECS: u64 = 30;

/// Watchdog tick for the dispatch loop, milliseconds.
pub const DISPATCH_TICK_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub listen_addr: SocketAddr,
    /// Base URL workers use to reach this orchestrator.
    pub public_url: String,
    /// Root directory for per-entity log artifacts.
    pub log_root: PathBuf,
    pub db: DbConfig,
    pub monitor_interval_secs: u64,
    /// Terminal jobs older than this many days are swept, 0 disables.
    pub retention_days: u32,
    /// Shared secret handed to spawned workers; worker registration calls
    /// must present it when set.
    pub callback_token: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8420".parse().unwrap(),
            public_url: "http://127.0.0.1:8420".to_string(),
            log_root: PathBuf::from("logs"),
            db: DbConfig::default(),
            monitor_interval_secs: MONITOR_INTERVAL_DEFAULT_SECS,
            retention_days: 0,
            callback_token: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MONITOR_INTERVAL_MIN_SECS..=MONITOR_INTERVAL_MAX_SECS)
            .contains(&self.monitor_interval_secs)
        {
            return Err(DispatchError::Fatal(format!(
                "monitor interval must be between {MONITOR_INTERVAL_MIN_SECS} and {MONITOR_INTERVAL_MAX_SECS} seconds"
            )));
        }
        self.db.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Sqlite,
    Postgresql,
    Mysql,
}

impl std::fmt::Display for DbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbKind::Sqlite => write!(f, "sqlite"),
            DbKind::Postgresql => write!(f, "postgresql"),
            DbKind::Mysql => write!(f, "mysql"),
        }
    }
}

impl std::str::FromStr for DbKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite" => Ok(DbKind::Sqlite),
            "postgresql" => Ok(DbKind::Postgresql),
            "mysql" => Ok(DbKind::Mysql),
            other => Err(DispatchError::validation(format!(
                "unknown database type '{other}'"
            ))),
        }
    }
}

/// Database connection settings, mirroring the `database` config category
/// exposed over `GET/PUT /api/db`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub db_type: DbKind,
    /// SQLite database file path (db_type = sqlite).
    pub sqlite_path: PathBuf,
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_db: String,
    pub pg_schema: String,
    pub pg_user: String,
    pub pg_pwd: String,
    pub use_managed_identity: bool,
    pub pg_managed_identity_user: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_type: DbKind::Sqlite,
            sqlite_path: PathBuf::from("dispatch.db"),
            pg_host: "localhost".to_string(),
            pg_port: 5432,
            pg_db: "dispatch".to_string(),
            pg_schema: "public".to_string(),
            pg_user: String::new(),
            pg_pwd: String::new(),
            use_managed_identity: false,
            pg_managed_identity_user: String::new(),
        }
    }
}

impl DbConfig {
    pub fn validate(&self) -> Result<()> {
        match self.db_type {
            DbKind::Sqlite => Ok(()),
            DbKind::Postgresql => {
                if self.pg_host.is_empty() || self.pg_db.is_empty() {
                    return Err(DispatchError::validation(
                        "postgresql requires PG_HOST and PG_DB",
                    ));
                }
                if !self.use_managed_identity && self.pg_user.is_empty() {
                    return Err(DispatchError::validation(
                        "postgresql requires PG_USER unless managed identity is enabled",
                    ));
                }
                Ok(())
            }
            DbKind::Mysql => Err(DispatchError::validation(
                "mysql is not a supported storage backend",
            )),
        }
    }

    /// Connection URL for the sqlx Any driver.
    pub fn url(&self) -> Result<String> {
        match self.db_type {
            DbKind::Sqlite => Ok(format!(
                "sqlite://{}?mode=rwc",
                self.sqlite_path.display()
            )),
            DbKind::Postgresql => {
                let user = if self.use_managed_identity {
                    &self.pg_managed_identity_user
                } else {
                    &self.pg_user
                };
                Ok(format!(
                    "postgres://{}:{}@{}:{}/{}",
                    user, self.pg_pwd, self.pg_host, self.pg_port, self.pg_db
                ))
            }
            DbKind::Mysql => Err(DispatchError::validation(
                "mysql is not a supported storage backend",
            )),
        }
    }
}

/// Configuration for a worker node process.
#[derive(Debug, Clone)]
pub struct WorkerNodeConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
    pub orchestrator_url: String,
    pub max_jobs: u32,
    pub callback_token: Option<String>,
}

impl WorkerNodeConfig {
    pub fn new(name: String, listen_addr: SocketAddr, orchestrator_url: String) -> Self {
        Self {
            name,
            listen_addr,
            orchestrator_url,
            max_jobs: 10,
            callback_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_url_is_rwc() {
        let db = DbConfig::default();
        assert_eq!(db.url().unwrap(), "sqlite://dispatch.db?mode=rwc");
    }

    #[test]
    fn mysql_is_rejected() {
        let db = DbConfig {
            db_type: DbKind::Mysql,
            ..DbConfig::default()
        };
        assert!(db.validate().is_err());
        assert!(db.url().is_err());
    }

    #[test]
    fn postgres_requires_user() {
        let db = DbConfig {
            db_type: DbKind::Postgresql,
            ..DbConfig::default()
        };
        assert!(db.validate().is_err());

        let db = DbConfig {
            db_type: DbKind::Postgresql,
            pg_user: "dispatch".into(),
            ..DbConfig::default()
        };
        assert!(db.validate().is_ok());
        assert!(db.url().unwrap().starts_with("postgres://dispatch:"));
    }
}
