//! Database configuration endpoints.
//!
//! Settings live in the `database` config category. `PUT /api/db` stores
//! new values; `POST /api/db/initialize` validates them and proves the
//! target is reachable. The active repository is swapped at startup, so
//! changes take effect on the next restart.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::config::{DbConfig, DbKind};
use crate::error::{DispatchError, Result};
use crate::repo::SqlRepository;

use super::AppState;

pub const DB_CONFIG_CATEGORY: &str = "database";

#[derive(Debug, Serialize, Deserialize)]
pub struct DbSettings {
    #[serde(rename = "DB_TYPE")]
    pub db_type: String,
    #[serde(rename = "SQLITE_PATH")]
    pub sqlite_path: String,
    #[serde(rename = "PG_HOST")]
    pub pg_host: String,
    #[serde(rename = "PG_PORT")]
    pub pg_port: u16,
    #[serde(rename = "PG_DB")]
    pub pg_db: String,
    #[serde(rename = "PG_SCHEMA")]
    pub pg_schema: String,
    #[serde(rename = "PG_USER")]
    pub pg_user: String,
    #[serde(rename = "PG_PWD")]
    pub pg_pwd: String,
    #[serde(rename = "USE_MANAGED_IDENTITY")]
    pub use_managed_identity: bool,
    #[serde(rename = "PG_MANAGED_IDENTITY_USER")]
    pub pg_managed_identity_user: String,
}

impl DbSettings {
    fn from_config(config: &DbConfig) -> Self {
        Self {
            db_type: config.db_type.to_string(),
            sqlite_path: config.sqlite_path.display().to_string(),
            pg_host: config.pg_host.clone(),
            pg_port: config.pg_port,
            pg_db: config.pg_db.clone(),
            pg_schema: config.pg_schema.clone(),
            pg_user: config.pg_user.clone(),
            pg_pwd: mask(&config.pg_pwd),
            use_managed_identity: config.use_managed_identity,
            pg_managed_identity_user: config.pg_managed_identity_user.clone(),
        }
    }

    fn to_config(&self) -> Result<DbConfig> {
        Ok(DbConfig {
            db_type: self.db_type.parse::<DbKind>()?,
            sqlite_path: self.sqlite_path.clone().into(),
            pg_host: self.pg_host.clone(),
            pg_port: self.pg_port,
            pg_db: self.pg_db.clone(),
            pg_schema: self.pg_schema.clone(),
            pg_user: self.pg_user.clone(),
            pg_pwd: self.pg_pwd.clone(),
            use_managed_identity: self.use_managed_identity,
            pg_managed_identity_user: self.pg_managed_identity_user.clone(),
        })
    }

    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DB_TYPE".into(), self.db_type.clone());
        map.insert("SQLITE_PATH".into(), self.sqlite_path.clone());
        map.insert("PG_HOST".into(), self.pg_host.clone());
        map.insert("PG_PORT".into(), self.pg_port.to_string());
        map.insert("PG_DB".into(), self.pg_db.clone());
        map.insert("PG_SCHEMA".into(), self.pg_schema.clone());
        map.insert("PG_USER".into(), self.pg_user.clone());
        map.insert("PG_PWD".into(), self.pg_pwd.clone());
        map.insert(
            "USE_MANAGED_IDENTITY".into(),
            self.use_managed_identity.to_string(),
        );
        map.insert(
            "PG_MANAGED_IDENTITY_USER".into(),
            self.pg_managed_identity_user.clone(),
        );
        map
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "***masked***".to_string()
    }
}

/// Stored settings layered over the running configuration's defaults.
pub async fn load_settings(state: &AppState) -> Result<DbSettings> {
    let stored = state.repo.get_config(DB_CONFIG_CATEGORY).await?;
    let mut settings = DbSettings::from_config(&state.config.db);
    if let Some(value) = stored.get("DB_TYPE") {
        settings.db_type = value.clone();
    }
    if let Some(value) = stored.get("SQLITE_PATH") {
        settings.sqlite_path = value.clone();
    }
    if let Some(value) = stored.get("PG_HOST") {
        settings.pg_host = value.clone();
    }
    if let Some(value) = stored.get("PG_PORT").and_then(|v| v.parse().ok()) {
        settings.pg_port = value;
    }
    if let Some(value) = stored.get("PG_DB") {
        settings.pg_db = value.clone();
    }
    if let Some(value) = stored.get("PG_SCHEMA") {
        settings.pg_schema = value.clone();
    }
    if let Some(value) = stored.get("PG_USER") {
        settings.pg_user = value.clone();
    }
    if let Some(value) = stored.get("PG_PWD") {
        if value != "***masked***" {
            settings.pg_pwd = value.clone();
        }
    }
    if let Some(value) = stored.get("USE_MANAGED_IDENTITY").and_then(|v| v.parse().ok()) {
        settings.use_managed_identity = value;
    }
    if let Some(value) = stored.get("PG_MANAGED_IDENTITY_USER") {
        settings.pg_managed_identity_user = value.clone();
    }
    Ok(settings)
}

pub async fn get_handler(State(state): State<AppState>) -> Result<Json<DbSettings>> {
    let mut settings = load_settings(&state).await?;
    settings.pg_pwd = mask(&settings.pg_pwd);
    Ok(Json(settings))
}

pub async fn put_handler(
    State(state): State<AppState>,
    Json(mut settings): Json<DbSettings>,
) -> Result<Json<DbSettings>> {
    // A masked password echoed back means "keep the stored one".
    if settings.pg_pwd == "***masked***" {
        let current = load_settings(&state).await?;
        settings.pg_pwd = current.pg_pwd;
    }
    // Parse errors surface before anything is stored.
    settings.to_config()?;
    state
        .repo
        .set_config(DB_CONFIG_CATEGORY, &settings.to_map())
        .await?;
    tracing::info!(db_type = %settings.db_type, "Database settings stored; restart to apply");
    let mut stored = settings;
    stored.pg_pwd = mask(&stored.pg_pwd);
    Ok(Json(stored))
}

/// Validate the stored settings and prove the target database is
/// reachable by opening it and creating the schema.
pub async fn initialize_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let settings = load_settings(&state).await?;
    let config = settings.to_config()?;
    config.validate()?;
    if config.db_type == DbKind::Mysql {
        return Err(DispatchError::validation(
            "mysql is not a supported storage backend",
        ));
    }
    SqlRepository::connect(&config).await?;
    tracing::info!(db_type = %config.db_type, "Database initialized");
    Ok(Json(serde_json::json!({
        "initialized": true,
        "db_type": config.db_type.to_string(),
        "note": "restart the orchestrator to switch the active store",
    })))
}
