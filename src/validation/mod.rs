//! Input validation module

use crate::models::{CreatePeriod, UpdateResponseRequest};
use thiserror::Error;

/// Longest free-text answer accepted for a single question
pub const MAX_RESPONSE_LENGTH: usize = 20_000;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' is too long (max {max} characters)")]
    TooLong { field: String, max: usize },

    #[error("Invalid email format")]
    InvalidEmail,

    #[error("Invalid username (letters, digits, '.', '-' and '_' only)")]
    InvalidUsername,

    #[error("Reviewers cannot be nominated for the {role} role")]
    InvalidRole { role: String },

    #[error("Year {year} is out of range")]
    InvalidYear { year: i32 },

    #[error("Invalid invitation code")]
    InvalidCode,
}

/// Emails are compared case-insensitively and stored lowercase
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.len() > 254 || !validator::validate_email(email) {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username.is_empty() {
        return Err(ValidationError::Required {
            field: "username".to_string(),
        });
    }
    if username.len() > 150 {
        return Err(ValidationError::TooLong {
            field: "username".to_string(),
            max: 150,
        });
    }
    let is_valid = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@'));
    if !is_valid {
        return Err(ValidationError::InvalidUsername);
    }
    Ok(())
}

/// Validate a person's first or last name
pub fn validate_name(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.len() > 100 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 100,
        });
    }
    Ok(())
}

pub fn validate_create_period(input: &CreatePeriod) -> Result<(), ValidationError> {
    if !(2000..=2100).contains(&input.year) {
        return Err(ValidationError::InvalidYear { year: input.year });
    }
    Ok(())
}

pub fn validate_response(input: &UpdateResponseRequest) -> Result<(), ValidationError> {
    if input.value.len() > MAX_RESPONSE_LENGTH {
        return Err(ValidationError::TooLong {
            field: "value".to_string(),
            max: MAX_RESPONSE_LENGTH,
        });
    }
    Ok(())
}

/// Invitation codes are six digits without a leading zero
pub fn validate_invitation_code(code: i32) -> Result<(), ValidationError> {
    use crate::workflow::invitations::{MAX_CODE, MIN_CODE};
    if !(MIN_CODE..=MAX_CODE).contains(&code) {
        return Err(ValidationError::InvalidCode);
    }
    Ok(())
}
