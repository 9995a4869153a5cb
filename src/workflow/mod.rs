//! Review-cycle rules: stages, nominations, forms and external invitations
//!
//! Everything in here is pure. Callers load rows, pass them in together with
//! the current time, and persist whatever the rules decide.

pub mod forms;
pub mod invitations;
pub mod nominations;
pub mod stages;

use axum::http::StatusCode;
use thiserror::Error;

use crate::export::ExportError;
use crate::mailer::MailError;
use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum ReviewError {
    /// Malformed input
    #[error("{0}")]
    Validation(String),

    /// Wrong stage, wrong owner, wrong reviewer
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Cooldowns, expired or used tokens, claimed invitations, deadlines
    #[error("{0}")]
    Rule(String),

    #[error("Database error")]
    Database(#[from] sqlx::Error),

    /// The message could not be handed to the mail service
    #[error("{0}")]
    Mail(#[from] MailError),

    #[error("Export failed")]
    Export(#[from] ExportError),
}

impl ReviewError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn rule(message: impl Into<String>) -> Self {
        Self::Rule(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Rule(_) => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Mail(_) => StatusCode::BAD_GATEWAY,
            Self::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ValidationError> for ReviewError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<forms::FormConfigError> for ReviewError {
    fn from(err: forms::FormConfigError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ReviewError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ReviewError::forbidden("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ReviewError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ReviewError::rule("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ReviewError::Database(sqlx::Error::RowNotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_database_error_hides_details() {
        let err = ReviewError::Database(sqlx::Error::Protocol("secret detail".into()));
        assert_eq!(err.to_string(), "Database error");
    }

    #[test]
    fn test_validation_error_converts() {
        let err: ReviewError = ValidationError::InvalidEmail.into();
        assert!(matches!(err, ReviewError::Validation(_)));
        assert_eq!(err.to_string(), "Invalid email format");
    }
}
