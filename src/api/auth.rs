//! Login/logout and password handling. Tokens are random UUIDs stored
//! server-side with an expiry; there is no JWT layer.

use axum::{
    extract::{Request, State},
    http::header,
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::User;

use super::AppState;

const SESSION_TTL_HOURS: i64 = 12;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default = "default_auth_source")]
    pub auth_source: String,
}

fn default_auth_source() -> String {
    "local".to_string()
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub logged_out: bool,
}

/// `salt$hex(sha256(salt + password))`
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{salt}${}", digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, expected)) => digest(salt, password) == expected,
        None => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    if request.auth_source != "local" {
        return Err(DispatchError::validation(format!(
            "auth source '{}' is not supported",
            request.auth_source
        )));
    }
    let user = state
        .repo
        .get_user_by_username(&request.username)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| DispatchError::validation("invalid credentials"))?;
    if !verify_password(&request.password, &user.password_hash) {
        return Err(DispatchError::validation("invalid credentials"));
    }

    let token = Uuid::new_v4().simple().to_string();
    let expires_at = Utc::now() + Duration::hours(SESSION_TTL_HOURS);
    state.repo.create_session(user.id, &token, expires_at).await?;
    state.repo.touch_last_login(user.id).await?;
    state.repo.purge_expired_sessions().await?;
    tracing::info!(username = %user.username, "User logged in");

    Ok(Json(LoginResponse {
        access_token: token,
        token_type: "bearer",
        user,
    }))
}

pub async fn logout_handler(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<LogoutResponse>> {
    if let Some(token) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        state.repo.delete_session(token).await?;
    }
    Ok(Json(LogoutResponse { logged_out: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("hunter2");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-hash"));
    }
}
