//! Middleware for authentication and security headers

use crate::handlers::auth::validate_staff_session;
use crate::handlers::external_auth::validate_external_session;
use crate::handlers::AppState;
use crate::models::StaffUser;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({"success": false, "data": null, "error": message})),
    )
        .into_response()
}

fn auth_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(json!({"success": false, "data": null, "error": "Authentication error"})),
    )
        .into_response()
}

/// Staff user extracted by middleware, available via Extension<StaffUser>
pub async fn require_staff(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let now = state.clock.now();

    match validate_staff_session(&state.pool, request.headers(), now).await {
        Ok(Some(user)) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Ok(None) => unauthorized("Not authenticated"),
        Err(e) => {
            tracing::error!("Session validation failed: {}", e);
            auth_error()
        }
    }
}

/// Layered inside `require_staff`
pub async fn require_admin(request: Request<Body>, next: Next) -> Response {
    match request.extensions().get::<StaffUser>() {
        Some(user) if user.is_admin => next.run(request).await,
        Some(_) => (
            StatusCode::FORBIDDEN,
            axum::Json(json!({"success": false, "data": null, "error": "Admin access required"})),
        )
            .into_response(),
        None => unauthorized("Not authenticated"),
    }
}

/// External user extracted by middleware, available via Extension<ExternalUser>
pub async fn require_external(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let now = state.clock.now();

    match validate_external_session(&state.pool, request.headers(), now).await {
        Ok(Some((user, session))) if user.is_enabled => {
            request.extensions_mut().insert(user);
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        Ok(_) => unauthorized("Session expired or invalid"),
        Err(e) => {
            tracing::error!("External session validation failed: {}", e);
            auth_error()
        }
    }
}

/// Security headers middleware
pub async fn security_headers(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; img-src 'self' data:; font-src 'self'; form-action 'self'; base-uri 'self'; frame-ancestors 'none'",
        ),
    );

    if state.is_production {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        );
    }

    response
}
