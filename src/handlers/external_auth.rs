//! External reviewers: sign-in links, sessions and responses

use crate::db;
use crate::mailer::Email;
use crate::models::*;
use crate::validation::{
    normalize_email, validate_email, validate_invitation_code, validate_response,
};
use crate::workflow::invitations::{
    check_token, claim_invitation, ensure_enabled, generate_secret, no_pending_invitations,
    redeem_url, token_body, token_expiry, token_not_found, ClaimAction,
};
use crate::workflow::ReviewError;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use std::net::SocketAddr;
use uuid::Uuid;

use super::auth::{
    check_rate_limit, clear_cookie, client_ip, extract_cookie, generate_session_token,
    hash_token, record_attempt, session_cookie, user_agent,
};
use super::cycle::review_views;
use super::nominations::apply_response;
use super::{ok, ApiResult, AppState};

/// Session cookie name
pub const EXTERNAL_SESSION_COOKIE: &str = "sr_external_session";

/// Sign-in link requests per IP per hour
pub const MAX_TOKEN_REQUESTS: i64 = 10;

/// Email a single-use sign-in link. Malformed input is answered with
/// `ok: false` rather than an error.
pub async fn send_token(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<SendTokenRequest>,
) -> ApiResult<SendTokenResponse> {
    let now = state.clock.now();
    let ip = client_ip(Some(peer), &headers, &state.trusted_proxies);

    if !check_rate_limit(&state.pool, &ip, "external_token", MAX_TOKEN_REQUESTS, now).await {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiResponse::error(
                "Too many requests. Please try again later.",
            )),
        ));
    }
    record_attempt(&state.pool, &ip, "external_token", now).await;

    let email = normalize_email(&input.email);
    let checked = validate_email(&email).and_then(|_| match input.code {
        Some(code) => validate_invitation_code(code),
        None => Ok(()),
    });
    if let Err(e) = checked {
        tracing::warn!(client_ip = %ip, "Sign-in link request refused: {}", e);
        return ok(SendTokenResponse { ok: false });
    }

    let secret = generate_secret();
    let mut tx = state.pool.begin().await?;
    db::external::insert_token(&mut tx, &email, input.code, &secret, token_expiry(now)).await?;

    state
        .mailer
        .send(Email {
            from: state.mail_sender.clone(),
            to: email.clone(),
            subject: "Your feedback sign-in link".to_string(),
            body: token_body(&redeem_url(&state.public_url, &secret)),
        })
        .await?;

    tx.commit().await?;

    tracing::info!(client_ip = %ip, with_code = input.code.is_some(), "Sign-in link sent");
    ok(SendTokenResponse { ok: true })
}

/// Exchange a sign-in secret for a session, claiming the invitation the
/// link was requested with
pub async fn redeem_token(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<RedeemTokenRequest>,
) -> Result<impl IntoResponse, ReviewError> {
    let now = state.clock.now();
    let ip = client_ip(Some(peer), &headers, &state.trusted_proxies);

    let mut tx = state.pool.begin().await?;

    let token = db::external::find_token_for_update(&mut tx, input.token.trim())
        .await?
        .ok_or_else(token_not_found)?;
    check_token(&token, now)?;

    let user = match token.code {
        Some(code) => claim_by_code(&mut tx, &token.email, code).await?,
        None => db::external::find_external_user_by_email(&mut tx, &token.email)
            .await?
            .ok_or_else(no_pending_invitations)?,
    };
    ensure_enabled(&user)?;

    if !db::external::mark_token_redeemed(&mut tx, token.id, now, &ip).await? {
        return Err(ReviewError::rule("This token has already been used."));
    }

    let session_token = generate_session_token();
    let expires_at = now + Duration::hours(state.external_session_hours);
    create_external_session(
        &mut tx,
        user.id,
        &hash_token(&session_token),
        expires_at,
        &ip,
        user_agent(&headers).as_deref(),
    )
    .await?;

    tx.commit().await?;

    tracing::info!(external_user_id = %user.id, client_ip = %ip, "External sign-in");

    let cookie = session_cookie(
        EXTERNAL_SESSION_COOKIE,
        &session_token,
        state.external_session_hours,
        state.is_production,
    );
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(ApiResponse::success(RedeemTokenResponse {
            token: session_token,
            session: ExternalSessionResponse {
                email: user.email,
                name: user.name,
                session_expires_at: expires_at,
            },
        })),
    ))
}

/// Bind the invitation with `code` to the user for `email`, creating the
/// user on first sign-in
async fn claim_by_code(
    conn: &mut PgConnection,
    email: &str,
    code: i32,
) -> Result<ExternalUser, ReviewError> {
    let invitation = db::external::find_invitation_by_code_for_update(&mut *conn, code)
        .await?
        .ok_or_else(|| ReviewError::not_found("This invitation code is not valid."))?;
    let nomination = db::nominations::find_nomination(&mut *conn, invitation.nomination_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("This invitation code is not valid."))?;

    let user = db::external::get_or_create_external_user(
        &mut *conn,
        email,
        nomination.external_name.as_deref(),
    )
    .await?;

    match claim_invitation(invitation.user_id, user.id)? {
        ClaimAction::Bind => {
            db::external::bind_invitation(&mut *conn, invitation.nomination_id, user.id).await?;
            tracing::info!(
                nomination_id = %invitation.nomination_id,
                external_user_id = %user.id,
                "Invitation claimed"
            );
        }
        ClaimAction::AlreadyOwned => {}
    }

    Ok(user)
}

async fn create_external_session(
    conn: &mut PgConnection,
    external_user_id: Uuid,
    token_hash: &str,
    expires_at: DateTime<Utc>,
    ip_address: &str,
    user_agent: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO external_sessions (external_user_id, token_hash, expires_at, ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(external_user_id)
    .bind(token_hash)
    .bind(expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .execute(conn)
    .await?;
    Ok(())
}

/// The external user and session for the session cookie, if still valid
pub async fn validate_external_session(
    pool: &PgPool,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<Option<(ExternalUser, ExternalSession)>, ReviewError> {
    let Some(token) = extract_cookie(headers, EXTERNAL_SESSION_COOKIE) else {
        return Ok(None);
    };

    let mut conn = pool.acquire().await?;
    let session = sqlx::query_as::<_, ExternalSession>(
        "SELECT * FROM external_sessions WHERE token_hash = $1 AND expires_at > $2",
    )
    .bind(hash_token(&token))
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(session) = session else {
        return Ok(None);
    };
    let user = db::external::find_external_user(&mut conn, session.external_user_id).await?;
    Ok(user.map(|u| (u, session)))
}

pub async fn get_current_external(
    Extension(user): Extension<ExternalUser>,
    Extension(session): Extension<ExternalSession>,
) -> ApiResult<ExternalSessionResponse> {
    ok(ExternalSessionResponse {
        email: user.email,
        name: user.name,
        session_expires_at: session.expires_at,
    })
}

pub async fn external_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(token) = extract_cookie(&headers, EXTERNAL_SESSION_COOKIE) {
        let _ = sqlx::query("DELETE FROM external_sessions WHERE token_hash = $1")
            .bind(hash_token(&token))
            .execute(&state.pool)
            .await;
    }

    (
        StatusCode::OK,
        [(
            header::SET_COOKIE,
            clear_cookie(EXTERNAL_SESSION_COOKIE, state.is_production),
        )],
        Json(ApiResponse::<()>::empty()),
    )
}

/// Every nomination whose invitation the caller has claimed
pub async fn external_reviews(
    State(state): State<AppState>,
    Extension(user): Extension<ExternalUser>,
) -> ApiResult<Vec<ReviewerNominationResponse>> {
    let mut conn = state.pool.acquire().await?;
    let nominations = db::nominations::nominations_for_external_user(&mut conn, user.id).await?;
    ok(review_views(&mut conn, nominations, |_| true).await?)
}

pub async fn save_external_response(
    State(state): State<AppState>,
    Extension(user): Extension<ExternalUser>,
    Json(input): Json<UpdateResponseRequest>,
) -> ApiResult<ResponseValue> {
    validate_response(&input)?;
    let now = state.clock.now();
    let mut tx = state.pool.begin().await?;

    let nomination = db::nominations::find_nomination(&mut tx, input.nomination_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Nomination not found"))?;
    let invitation = db::external::find_invitation(&mut tx, nomination.id).await?;
    if invitation.and_then(|i| i.user_id) != Some(user.id) {
        return Err(ReviewError::forbidden(
            "This nomination is not assigned to you",
        ));
    }

    let response = apply_response(&mut tx, &nomination, &input, now).await?;
    tx.commit().await?;

    ok(response)
}
