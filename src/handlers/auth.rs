//! Staff authentication: login, sessions, rate limiting, client address

use crate::db;
use crate::models::*;
use crate::workflow::ReviewError;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool};
use std::net::SocketAddr;
use uuid::Uuid;

use super::AppState;

/// Session cookie name
pub const SESSION_COOKIE: &str = "sr_staff_session";

/// Rate limit: max login attempts per IP per hour
pub const MAX_LOGIN_ATTEMPTS: i64 = 10;

// =============================================================================
// Login Endpoint
// =============================================================================

/// Staff login with username and password
pub async fn staff_login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<LoginRequest>,
) -> impl IntoResponse {
    let client_ip = client_ip(Some(peer), &headers, &state.trusted_proxies);
    let now = state.clock.now();

    if !check_rate_limit(&state.pool, &client_ip, "login", MAX_LOGIN_ATTEMPTS, now).await {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::SET_COOKIE, String::new())],
            Json(ApiResponse::<StaffUserResponse>::error(
                "Too many login attempts. Please try again later.",
            )),
        );
    }
    record_attempt(&state.pool, &client_ip, "login", now).await;

    let user = match state.pool.acquire().await {
        Ok(mut conn) => db::staff::find_by_username(&mut conn, input.username.trim()).await,
        Err(e) => Err(e),
    };

    let user = match user {
        Ok(Some(u)) if u.is_current(now) => u,
        Ok(_) => {
            // Don't reveal whether the username exists
            return (
                StatusCode::UNAUTHORIZED,
                [(header::SET_COOKIE, String::new())],
                Json(ApiResponse::error("Invalid username or password")),
            );
        }
        Err(e) => {
            tracing::error!("Database error during login: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::SET_COOKIE, String::new())],
                Json(ApiResponse::error("Authentication error")),
            );
        }
    };

    if !verify_password(&input.password, &user.password_hash) {
        tracing::info!(username = %user.username, "Failed login");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::SET_COOKIE, String::new())],
            Json(ApiResponse::error("Invalid username or password")),
        );
    }

    let token = generate_session_token();
    let expires_at = now + Duration::hours(state.session_hours);
    let user_agent = user_agent(&headers);

    let created = async {
        let mut tx = state.pool.begin().await?;
        create_staff_session(
            &mut tx,
            user.id,
            &hash_token(&token),
            expires_at,
            &client_ip,
            user_agent.as_deref(),
        )
        .await?;
        db::staff::touch_last_login(&mut tx, user.id, now).await?;
        tx.commit().await
    }
    .await;

    if let Err(e) = created {
        tracing::error!("Failed to create staff session: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::SET_COOKIE, String::new())],
            Json(ApiResponse::error("Failed to create session")),
        );
    }

    tracing::info!(username = %user.username, "Staff login");

    (
        StatusCode::OK,
        [(
            header::SET_COOKIE,
            session_cookie(SESSION_COOKIE, &token, state.session_hours, state.is_production),
        )],
        Json(ApiResponse::success(StaffUserResponse::from(user))),
    )
}

/// Staff logout
pub async fn staff_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(token) = extract_cookie(&headers, SESSION_COOKIE) {
        let _ = sqlx::query("DELETE FROM staff_sessions WHERE token_hash = $1")
            .bind(hash_token(&token))
            .execute(&state.pool)
            .await;
    }

    (
        StatusCode::OK,
        [(
            header::SET_COOKIE,
            clear_cookie(SESSION_COOKIE, state.is_production),
        )],
        Json(ApiResponse::<()>::empty()),
    )
}

/// Current staff user
pub async fn get_current_staff(Extension(user): Extension<StaffUser>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ApiResponse::success(StaffUserResponse::from(user))),
    )
}

// =============================================================================
// Sessions
// =============================================================================

async fn create_staff_session(
    conn: &mut PgConnection,
    staff_user_id: Uuid,
    token_hash: &str,
    expires_at: DateTime<Utc>,
    ip_address: &str,
    user_agent: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO staff_sessions (staff_user_id, token_hash, expires_at, ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(staff_user_id)
    .bind(token_hash)
    .bind(expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .execute(conn)
    .await?;
    Ok(())
}

/// The current staff user for the session cookie, if the session is valid
pub async fn validate_staff_session(
    pool: &PgPool,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<Option<StaffUser>, ReviewError> {
    let Some(token) = extract_cookie(headers, SESSION_COOKIE) else {
        return Ok(None);
    };

    let user = sqlx::query_as::<_, StaffUser>(
        r#"
        SELECT u.* FROM staff_sessions s
        JOIN staff_users u ON u.id = s.staff_user_id
        WHERE s.token_hash = $1 AND s.expires_at > $2
        "#,
    )
    .bind(hash_token(&token))
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(user.filter(|u| u.is_current(now)))
}

// =============================================================================
// Password Utilities
// =============================================================================

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => {
            tracing::error!("Invalid password hash in database");
            false
        }
    }
}

// =============================================================================
// Cookie & Token Helpers
// =============================================================================

pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    let prefix = format!("{}=", name);

    cookie_header
        .split(';')
        .map(str::trim)
        .find_map(|cookie| cookie.strip_prefix(prefix.as_str()))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn session_cookie(name: &str, token: &str, hours: i64, secure: bool) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}{}",
        name,
        token,
        hours * 3600,
        if secure { "; Secure" } else { "" }
    )
}

pub fn clear_cookie(name: &str, secure: bool) -> String {
    session_cookie(name, "", 0, secure)
}

/// 32 random bytes, hex encoded
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Only this hash of a session secret is stored
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.chars().take(500).collect())
}

/// The peer address, or the forwarded client address when the peer is a
/// trusted proxy
pub fn client_ip(
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    trusted_proxies: &[String],
) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    let peer_ip = peer.ip().to_string();

    if !trusted_proxies.iter().any(|p| peer_ip.starts_with(p.as_str())) {
        return peer_ip;
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    forwarded.map(str::to_string).unwrap_or(peer_ip)
}

// =============================================================================
// Rate Limiting
// =============================================================================

pub async fn check_rate_limit(
    pool: &PgPool,
    ip: &str,
    endpoint: &str,
    max_attempts: i64,
    now: DateTime<Utc>,
) -> bool {
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM rate_limit_attempts
        WHERE ip_address = $1 AND endpoint = $2
        AND attempted_at > $3
        "#,
    )
    .bind(ip)
    .bind(endpoint)
    .bind(now - Duration::hours(1))
    .fetch_one(pool)
    .await;

    under_limit(count, max_attempts, ip, endpoint)
}

/// A failed count lets the request through and is logged
fn under_limit(
    count: Result<i64, sqlx::Error>,
    max_attempts: i64,
    ip: &str,
    endpoint: &str,
) -> bool {
    match count {
        Ok(count) => count < max_attempts,
        Err(e) => {
            tracing::warn!(%ip, %endpoint, "Rate limit check failed: {}", e);
            true
        }
    }
}

pub async fn record_attempt(pool: &PgPool, ip: &str, endpoint: &str, now: DateTime<Utc>) {
    if let Err(e) = sqlx::query(
        "INSERT INTO rate_limit_attempts (ip_address, endpoint, attempted_at) VALUES ($1, $2, $3)",
    )
    .bind(ip)
    .bind(endpoint)
    .bind(now)
    .execute(pool)
    .await
    {
        tracing::warn!(%ip, %endpoint, "Failed to record rate limit attempt: {}", e);
    }
}
