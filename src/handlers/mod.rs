//! HTTP request handlers

pub mod admin;
pub mod auth;
pub mod cycle;
pub mod external_auth;
pub mod middleware;
pub mod nominations;

pub use admin::*;
pub use auth::*;
pub use cycle::*;
pub use external_auth::*;
pub use nominations::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::sync::Arc;

use crate::clock::Clock;
use crate::mailer::Mailer;
use crate::models::ApiResponse;
use crate::workflow::ReviewError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub clock: Arc<dyn Clock>,
    pub mailer: Arc<dyn Mailer>,
    pub timezone: Tz,
    /// Base URL for links in emails
    pub public_url: String,
    pub mail_sender: String,
    pub is_production: bool,
    /// Trusted proxy IP prefixes for X-Forwarded-For validation
    pub trusted_proxies: Vec<String>,
    pub session_hours: i64,
    pub external_session_hours: i64,
}

/// Successful handler result, or an error rendered as an error envelope
pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ReviewError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

/// `data: null` for "no current review cycle"
pub fn no_cycle<T>() -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::empty())))
}

impl IntoResponse for ReviewError {
    fn into_response(self) -> Response {
        match &self {
            ReviewError::Database(e) => tracing::error!("Database error: {}", e),
            ReviewError::Mail(e) => tracing::error!("Mail error: {}", e),
            ReviewError::Export(e) => tracing::error!("Export error: {}", e),
            _ => tracing::debug!("Request refused: {}", self),
        }
        (
            self.status_code(),
            Json(ApiResponse::<()>::error(self.to_string())),
        )
            .into_response()
    }
}
